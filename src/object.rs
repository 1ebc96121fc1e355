//! Handles to boundary-side values.
//!
//! Two flavors with one tradeoff between them:
//!
//! - [`Object`] anchors its value in the runtime's persistent registry. It
//!   survives arbitrary stack churn and re-resolves through the registry on
//!   every access: safe, but each access costs a lookup.
//! - [`StackObject`] anchors a fixed absolute stack position, computed once
//!   at construction and never recomputed. It is as cheap as an index, but
//!   any net push/pop below it invalidates it. Prefer it inside a single
//!   frame; prefer `Object` across frames.
//!
//! Both hand out lazy [`Proxy`] accessors for keyed and indexed fields, and
//! iterate tables through the runtime's next-key primitive.

use std::rc::Rc;

use tether_core::{ConvertFail, FromStack, StackGuard, ToStack};
use tether_runtime::{RegistryKey, RuntimeError, Table, TableKey, Value, ValueKind, Vm};

/// A registry-anchored handle to a boundary value.
#[derive(Debug)]
pub struct Object {
    vm: Vm,
    key: RegistryKey,
}

impl Object {
    /// Anchor the value at a stack index without consuming it.
    pub fn from_stack(vm: &Vm, index: i32) -> Result<Object, RuntimeError> {
        let value = vm.value_at(index)?;
        Ok(Object::from_value(vm, value))
    }

    /// Anchor an owned value.
    pub fn from_value(vm: &Vm, value: Value) -> Object {
        Object {
            vm: vm.clone(),
            key: vm.ref_value(value),
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Re-resolve the anchored value through the registry.
    pub fn value(&self) -> Result<Value, RuntimeError> {
        self.vm.registry_get(self.key)
    }

    pub fn kind(&self) -> ValueKind {
        self.value().map(|v| v.kind()).unwrap_or(ValueKind::Nil)
    }

    /// Push the value onto the stack and hand back a stack-anchored handle
    /// to the pushed copy.
    pub fn push(&self) -> Result<StackObject, RuntimeError> {
        self.vm.push(self.value()?);
        StackObject::from_stack(&self.vm, -1)
    }

    /// Lazy accessor for `self[key]`.
    pub fn at(&self, key: impl Into<TableKey>) -> Proxy {
        Proxy {
            vm: self.vm.clone(),
            anchor: Anchor::Registry(self.key),
            key: key.into(),
        }
    }

    pub fn get<V: FromStack>(&self, key: impl Into<TableKey>) -> Result<V, RuntimeError> {
        self.at(key).get()
    }

    pub fn set<V: ToStack>(&self, key: impl Into<TableKey>, value: V) -> Result<(), RuntimeError> {
        self.at(key).set(value)
    }

    /// Iterate the anchored table's entries as `(key, value)` handle pairs.
    pub fn iter(&self) -> Result<Pairs, RuntimeError> {
        require_table(&self.value()?)?;
        Ok(Pairs {
            vm: self.vm.clone(),
            anchor: Anchor::Registry(self.key),
            cursor: None,
            done: false,
        })
    }
}

impl Clone for Object {
    fn clone(&self) -> Object {
        let value = self.value().unwrap_or(Value::Nil);
        Object::from_value(&self.vm, value)
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.vm.unref(self.key);
    }
}

/// A stack-anchored handle to a boundary value.
#[derive(Debug, Clone)]
pub struct StackObject {
    vm: Vm,
    position: usize,
}

impl StackObject {
    /// Anchor the absolute position of the value currently at `index`.
    pub fn from_stack(vm: &Vm, index: i32) -> Result<StackObject, RuntimeError> {
        Ok(StackObject {
            vm: vm.clone(),
            position: vm.absolute(index)?,
        })
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The anchored absolute stack position (1-based).
    pub fn index(&self) -> usize {
        self.position
    }

    pub fn value(&self) -> Result<Value, RuntimeError> {
        self.vm.value_at_absolute(self.position)
    }

    pub fn kind(&self) -> ValueKind {
        self.value().map(|v| v.kind()).unwrap_or(ValueKind::Nil)
    }

    /// Push a copy of the anchored value; the handle for the copy is
    /// anchored at the new top.
    pub fn push(&self) -> Result<StackObject, RuntimeError> {
        self.vm.push(self.value()?);
        StackObject::from_stack(&self.vm, -1)
    }

    /// Pop this handle's slot. It must be the top of the stack; popping a
    /// buried stack anchor would invalidate every handle above it silently.
    pub fn pop(self) -> Result<(), RuntimeError> {
        let top = self.vm.absolute(-1)?;
        if top != self.position {
            return Err(RuntimeError::raise(
                "stack handle popped out of order (not at the top)",
            ));
        }
        self.vm.pop(1);
        Ok(())
    }

    pub fn at(&self, key: impl Into<TableKey>) -> Proxy {
        Proxy {
            vm: self.vm.clone(),
            anchor: Anchor::Stack(self.position),
            key: key.into(),
        }
    }

    pub fn get<V: FromStack>(&self, key: impl Into<TableKey>) -> Result<V, RuntimeError> {
        self.at(key).get()
    }

    pub fn set<V: ToStack>(&self, key: impl Into<TableKey>, value: V) -> Result<(), RuntimeError> {
        self.at(key).set(value)
    }

    pub fn iter(&self) -> Result<Pairs, RuntimeError> {
        require_table(&self.value()?)?;
        Ok(Pairs {
            vm: self.vm.clone(),
            anchor: Anchor::Stack(self.position),
            cursor: None,
            done: false,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Anchor {
    Registry(RegistryKey),
    Stack(usize),
}

impl Anchor {
    fn resolve(&self, vm: &Vm) -> Result<Value, RuntimeError> {
        match self {
            Anchor::Registry(key) => vm.registry_get(*key),
            Anchor::Stack(position) => vm.value_at_absolute(*position),
        }
    }
}

fn require_table(value: &Value) -> Result<(), RuntimeError> {
    match value {
        Value::Table(_) => Ok(()),
        other => Err(RuntimeError::NotIndexable {
            kind: other.type_name(),
        }),
    }
}

/// A lazy accessor for one field of a handle's target.
///
/// Nothing is read until [`Proxy::get`] / [`Proxy::value`], and nothing is
/// written until [`Proxy::set`]; the owner is re-resolved on every access.
/// Assigning from another handle or proxy is a push/read/set round trip.
#[derive(Debug)]
pub struct Proxy {
    vm: Vm,
    anchor: Anchor,
    key: TableKey,
}

impl Proxy {
    /// The field's current boundary value.
    pub fn value(&self) -> Result<Value, RuntimeError> {
        let target = self.anchor.resolve(&self.vm)?;
        self.vm.get_field(&target, &self.key)
    }

    /// Read and convert the field.
    pub fn get<V: FromStack>(&self) -> Result<V, RuntimeError> {
        let _guard = StackGuard::new(&self.vm, 0, 0);
        let value = self.value()?;
        self.vm.push(value);
        match V::from_stack(&self.vm, -1) {
            Ok((storage, consumed)) => {
                // Forward before popping: the storage may point into the
                // anchored slot, and the pop could be its last reference.
                let value = V::forward(storage);
                self.vm.pop(consumed as usize);
                Ok(value)
            }
            Err(ConvertFail::Mismatch) => {
                let actual = self.vm.value_at(-1)?.type_name();
                self.vm.pop(1);
                Err(RuntimeError::raise(format!(
                    "bad cast from {} to {}",
                    actual,
                    std::any::type_name::<V>()
                )))
            }
            Err(ConvertFail::Fault(e)) => {
                self.vm.pop(1);
                Err(e)
            }
        }
    }

    /// Convert and write the field.
    pub fn set<V: ToStack>(&self, value: V) -> Result<(), RuntimeError> {
        let _guard = StackGuard::new(&self.vm, 0, 0);
        let target = self.anchor.resolve(&self.vm)?;
        let pushed = value.to_stack(&self.vm)?;
        let slot = if pushed == 0 {
            Value::Nil
        } else {
            let v = self.vm.value_at(-1)?;
            self.vm.pop(pushed as usize);
            v
        };
        self.vm.set_field(&target, self.key.clone(), slot)
    }

    /// Assign this field from another proxy's field.
    pub fn assign(&self, other: &Proxy) -> Result<(), RuntimeError> {
        self.set(other.value()?)
    }

    /// Anchor the field's value as a registry handle.
    pub fn to_object(&self) -> Result<Object, RuntimeError> {
        Ok(Object::from_value(&self.vm, self.value()?))
    }
}

/// Iterator over a table handle's entries.
///
/// Lazy and restartable per call (entries added or removed behind the
/// cursor are honored on the next step) but not rewindable mid-iteration.
/// Exhaustion is the end sentinel; a vanished or non-table target simply
/// ends the sequence.
#[derive(Debug)]
pub struct Pairs {
    vm: Vm,
    anchor: Anchor,
    cursor: Option<TableKey>,
    done: bool,
}

impl Iterator for Pairs {
    type Item = (Object, Object);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Ok(target) = self.anchor.resolve(&self.vm) else {
            self.done = true;
            return None;
        };
        match self.vm.next(&target, self.cursor.as_ref()) {
            Ok(Some((key, value))) => {
                self.cursor = Some(key.clone());
                Some((
                    Object::from_value(&self.vm, key.to_value()),
                    Object::from_value(&self.vm, value),
                ))
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions: handles are themselves converter-registered types.
// ---------------------------------------------------------------------------

impl FromStack for Object {
    type Storage = Object;
    const PRIMITIVE: bool = false;

    fn from_stack(vm: &Vm, index: i32) -> tether_core::Pulled<Object> {
        Ok((Object::from_stack(vm, index).map_err(ConvertFail::Fault)?, 1))
    }

    fn forward(storage: Object) -> Object {
        storage
    }
}

impl ToStack for Object {
    const PRIMITIVE: bool = false;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        debug_assert!(vm.same_instance(&self.vm), "handle pushed onto a foreign runtime");
        vm.push(self.value()?);
        Ok(1)
    }
}

impl ToStack for &Object {
    const PRIMITIVE: bool = false;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        debug_assert!(vm.same_instance(&self.vm), "handle pushed onto a foreign runtime");
        vm.push(self.value()?);
        Ok(1)
    }
}

impl FromStack for StackObject {
    type Storage = StackObject;
    const PRIMITIVE: bool = false;

    fn from_stack(vm: &Vm, index: i32) -> tether_core::Pulled<StackObject> {
        Ok((
            StackObject::from_stack(vm, index).map_err(ConvertFail::Fault)?,
            1,
        ))
    }

    fn forward(storage: StackObject) -> StackObject {
        storage
    }
}

impl ToStack for &StackObject {
    const PRIMITIVE: bool = false;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        debug_assert!(vm.same_instance(&self.vm), "handle pushed onto a foreign runtime");
        vm.push(self.value()?);
        Ok(1)
    }
}

/// A fresh, empty boundary table wrapped in a registry handle.
pub fn newtable(vm: &Vm) -> Object {
    Object::from_value(vm, Value::Table(Rc::new(Table::new())))
}

/// The runtime's global namespace as a registry handle.
pub fn globals(vm: &Vm) -> Object {
    Object::from_value(vm, Value::Table(vm.globals()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_survives_stack_churn() {
        let vm = Vm::new();
        vm.push(Value::Int(42));
        let handle = Object::from_stack(&vm, -1).unwrap();
        vm.pop(1);
        for _ in 0..8 {
            vm.push(Value::str("churn"));
        }
        vm.pop(8);
        assert_eq!(handle.value().unwrap(), Value::Int(42));
    }

    #[test]
    fn object_drop_releases_registry_slot() {
        let vm = Vm::new();
        let handle = Object::from_value(&vm, Value::Int(1));
        let key = handle.key;
        drop(handle);
        assert!(vm.registry_get(key).is_err());
    }

    #[test]
    fn clone_anchors_independently() {
        let vm = Vm::new();
        let a = Object::from_value(&vm, Value::Int(7));
        let b = a.clone();
        drop(a);
        assert_eq!(b.value().unwrap(), Value::Int(7));
    }

    #[test]
    fn proxy_get_set_roundtrip() {
        let vm = Vm::new();
        let table = newtable(&vm);
        table.set("answer", 42i64).unwrap();
        assert_eq!(table.get::<i64>("answer").unwrap(), 42);
        table.set(1i64, "first").unwrap();
        assert_eq!(table.get::<String>(1i64).unwrap(), "first");
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn proxy_bad_cast_reports_types() {
        let vm = Vm::new();
        let table = newtable(&vm);
        table.set("s", "text").unwrap();
        let err = table.get::<i64>("s").unwrap_err();
        assert!(err.to_string().contains("bad cast"));
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn proxy_assign_round_trips_between_handles() {
        let vm = Vm::new();
        let a = newtable(&vm);
        let b = newtable(&vm);
        a.set("x", 5i64).unwrap();
        b.at("y").assign(&a.at("x")).unwrap();
        assert_eq!(b.get::<i64>("y").unwrap(), 5);
    }

    #[test]
    fn stack_object_reads_fixed_slot() {
        let vm = Vm::new();
        let table = Rc::new(Table::new());
        table.raw_set(TableKey::str("k"), Value::Int(9));
        vm.push(Value::Table(table));
        let handle = StackObject::from_stack(&vm, -1).unwrap();
        vm.push(Value::str("above"));
        assert_eq!(handle.get::<i64>("k").unwrap(), 9);
        vm.pop(1);
        handle.pop().unwrap();
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn stack_object_pop_requires_top() {
        let vm = Vm::new();
        vm.push(Value::Int(1));
        let handle = StackObject::from_stack(&vm, -1).unwrap();
        vm.push(Value::Int(2));
        assert!(handle.pop().is_err());
        vm.pop(2);
    }

    #[test]
    fn iteration_yields_all_pairs() {
        let vm = Vm::new();
        let table = newtable(&vm);
        table.set(1i64, 10i64).unwrap();
        table.set(2i64, 20i64).unwrap();
        table.set("name", "x").unwrap();

        let mut count = 0;
        let mut int_sum = 0i64;
        for (key, value) in table.iter().unwrap() {
            count += 1;
            if key.kind() == ValueKind::Int
                && let Ok(Value::Int(i)) = value.value()
            {
                int_sum += i;
            }
        }
        assert_eq!(count, 3);
        assert_eq!(int_sum, 30);
    }

    #[test]
    fn iteration_over_non_table_is_empty_or_err() {
        let vm = Vm::new();
        let handle = Object::from_value(&vm, Value::Int(5));
        assert!(handle.iter().is_err());
    }

    #[test]
    fn globals_handle_sees_global_fields() {
        let vm = Vm::new();
        vm.globals().raw_set(TableKey::str("g"), Value::Int(3));
        let g = globals(&vm);
        assert_eq!(g.get::<i64>("g").unwrap(), 3);
    }
}
