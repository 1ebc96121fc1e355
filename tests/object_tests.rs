//! Handles against a live set of bindings: proxies, iteration, casting.

mod common;

use common::Fixture;
use tether::{
    Object, StackObject, Value, ValueKind, call, cast, conditional_call, globals, module, newtable,
};

fn build(f: &Fixture) {
    module(&f.vm)
        .unwrap()
        .def("double", |x: i64| x * 2)
        .unwrap()
        .constant("LIMIT", 100i64)
        .unwrap()
        .end()
        .unwrap();
}

#[test]
fn globals_expose_registered_names() {
    let f = Fixture::new();
    build(&f);

    let g = globals(&f.vm);
    assert_eq!(g.at("double").to_object().unwrap().kind(), ValueKind::Function);
    assert_eq!(g.get::<i64>("LIMIT").unwrap(), 100);
}

#[test]
fn object_survives_unrelated_stack_traffic() {
    let f = Fixture::new();
    build(&f);

    let table = newtable(&f.vm);
    table.set("x", 1i64).unwrap();
    for _ in 0..16 {
        f.vm.push(Value::Int(0));
    }
    f.vm.pop(16);
    assert_eq!(table.get::<i64>("x").unwrap(), 1);
}

#[test]
fn proxies_are_lazy_and_reresolve() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    let proxy = table.at("k");
    table.set("k", 5i64).unwrap();
    // The proxy reads the value as it is now, not as it was at creation.
    assert_eq!(proxy.get::<i64>().unwrap(), 5);
    table.set("k", 6i64).unwrap();
    assert_eq!(proxy.get::<i64>().unwrap(), 6);
}

#[test]
fn proxy_assignment_from_another_handle() {
    let f = Fixture::new();
    let a = newtable(&f.vm);
    let b = newtable(&f.vm);
    a.set("x", "moved").unwrap();
    b.at("y").assign(&a.at("x")).unwrap();
    assert_eq!(b.get::<String>("y").unwrap(), "moved");
}

#[test]
fn handles_can_hold_any_value_kind() {
    let f = Fixture::new();
    build(&f);

    let g = globals(&f.vm);
    let double = g.at("double").to_object().unwrap();
    let limit = g.at("LIMIT").to_object().unwrap();
    assert_eq!(double.kind(), ValueKind::Function);
    assert_eq!(limit.kind(), ValueKind::Int);
    assert_eq!(cast::<i64, _>(&limit).unwrap(), 100);
}

#[test]
fn stack_objects_read_through_fixed_slots() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set("k", 7i64).unwrap();

    let anchored = table.push().unwrap();
    assert_eq!(anchored.get::<i64>("k").unwrap(), 7);

    // Pushes above the anchor do not disturb it.
    f.vm.push(Value::Int(1));
    assert_eq!(anchored.get::<i64>("k").unwrap(), 7);
    f.vm.pop(1);

    anchored.pop().unwrap();
    assert_eq!(f.vm.top(), 0);
}

#[test]
fn stack_object_round_trips_to_object() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set("k", 9i64).unwrap();

    let anchored = table.push().unwrap();
    let detached = Object::from_stack(&f.vm, anchored.index() as i32).unwrap();
    anchored.pop().unwrap();
    assert_eq!(detached.get::<i64>("k").unwrap(), 9);
}

#[test]
fn iteration_covers_every_entry_lazily() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set(1i64, 10i64).unwrap();
    table.set(2i64, 20i64).unwrap();
    table.set(3i64, 30i64).unwrap();

    let mut sum = 0i64;
    for (_key, value) in table.iter().unwrap() {
        sum += cast::<i64, _>(&value).unwrap();
    }
    assert_eq!(sum, 60);
}

#[test]
fn iteration_restarts_from_scratch_per_call() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set(1i64, 10i64).unwrap();

    assert_eq!(table.iter().unwrap().count(), 1);
    table.set(2i64, 20i64).unwrap();
    assert_eq!(table.iter().unwrap().count(), 2);
}

#[test]
fn iteration_sees_mutation_behind_the_cursor() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set(1i64, 10i64).unwrap();
    table.set(2i64, 20i64).unwrap();
    table.set(3i64, 30i64).unwrap();

    let mut iter = table.iter().unwrap();
    let (first, _) = iter.next().unwrap();
    assert_eq!(cast::<i64, _>(&first).unwrap(), 1);
    // Remove the entry ahead of the cursor; the iterator honors it.
    table.set(2i64, Value::Nil).unwrap();
    let keys: Vec<i64> = iter.map(|(k, _)| cast::<i64, _>(&k).unwrap()).collect();
    assert_eq!(keys, vec![3]);
}

#[test]
fn conditional_call_distinguishes_callables() {
    let f = Fixture::new();
    build(&f);

    let g = globals(&f.vm);
    let double = g.at("double").to_object().unwrap();
    let limit = g.at("LIMIT").to_object().unwrap();

    let called: Option<i64> = conditional_call(&double, (21i64,)).unwrap();
    assert_eq!(called, Some(42));
    let skipped: Option<i64> = conditional_call(&limit, (21i64,)).unwrap();
    assert_eq!(skipped, None);
}

#[test]
fn conditional_call_honors_call_metamethods() {
    let f = Fixture::new();
    // A bound class object is a table made callable by its constructor
    // trampoline.
    module(&f.vm)
        .unwrap()
        .class_::<common::StringStore>("Storage")
        .unwrap()
        .constructor(common::StringStore::new)
        .def("get", common::StringStore::get)
        .endclass()
        .unwrap()
        .end()
        .unwrap();

    let class = globals(&f.vm).at("Storage").to_object().unwrap();
    let instance: Option<Object> = conditional_call(&class, ("hi",)).unwrap();
    let instance = instance.expect("class objects are callable");
    assert_eq!(instance.kind(), ValueKind::UserData);
}

#[test]
fn cast_between_handle_flavors() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    table.set("k", 3i64).unwrap();

    let anchored: StackObject = table.push().unwrap();
    let as_object: Object = cast(&anchored).unwrap();
    anchored.pop().unwrap();
    assert_eq!(as_object.get::<i64>("k").unwrap(), 3);
}

#[test]
fn stale_object_accesses_fail_cleanly() {
    let f = Fixture::new();
    let table = newtable(&f.vm);
    let proxy = table.at("k");
    drop(table);
    assert!(proxy.get::<i64>().is_err());
}
