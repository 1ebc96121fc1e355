//! Overload resolution.
//!
//! Candidates registered under one name are tried in registration order;
//! the first whose argument pull succeeds wins. This is deliberately
//! first-match, not best-match: when a call could satisfy several
//! candidates, whichever was registered first dispatches.

use std::cell::RefCell;
use std::rc::Rc;

use tether_runtime::{NativeFunction, RuntimeError, Table, TableKey, Value, Vm};

use crate::convert::ConvertFail;
use crate::marshal::MarshalledFn;

/// A name's registered callables.
///
/// Every name starts as `Single`. The second registration under the same
/// name promotes the entry to `Overloaded` in place; later registrations
/// append. The boundary-visible closure holds the entry, not a candidate,
/// so promotion never disturbs existing call sites.
#[derive(Debug)]
pub enum FunctionEntry {
    Single(Rc<MarshalledFn>),
    Overloaded(Vec<Rc<MarshalledFn>>),
}

/// The shared slot behind one boundary-visible function name.
#[derive(Debug)]
pub struct FunctionSlot {
    name: String,
    entry: RefCell<FunctionEntry>,
}

impl FunctionSlot {
    pub fn new(name: impl Into<String>, first: MarshalledFn) -> Rc<FunctionSlot> {
        Rc::new(FunctionSlot {
            name: name.into(),
            entry: RefCell::new(FunctionEntry::Single(Rc::new(first))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidate_count(&self) -> usize {
        match &*self.entry.borrow() {
            FunctionEntry::Single(_) => 1,
            FunctionEntry::Overloaded(list) => list.len(),
        }
    }

    /// Append a candidate, promoting `Single` to `Overloaded` on the second
    /// registration.
    pub fn add_candidate(&self, candidate: MarshalledFn) {
        let mut entry = self.entry.borrow_mut();
        let current = std::mem::replace(&mut *entry, FunctionEntry::Overloaded(Vec::new()));
        *entry = match current {
            FunctionEntry::Single(first) => {
                FunctionEntry::Overloaded(vec![first, Rc::new(candidate)])
            }
            FunctionEntry::Overloaded(mut list) => {
                list.push(Rc::new(candidate));
                FunctionEntry::Overloaded(list)
            }
        };
    }

    /// Try candidates in registration order against the current frame.
    ///
    /// A soft mismatch falls through to the next candidate; a hard fault
    /// propagates immediately. When no candidate matches, the error names
    /// the dynamic type of every supplied argument.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn dispatch(&self, vm: &Vm) -> Result<u32, RuntimeError> {
        let candidates: Vec<Rc<MarshalledFn>> = match &*self.entry.borrow() {
            FunctionEntry::Single(f) => vec![f.clone()],
            FunctionEntry::Overloaded(list) => list.clone(),
        };
        for candidate in candidates {
            match candidate.invoke(vm) {
                Ok(pushed) => return Ok(pushed),
                Err(ConvertFail::Mismatch) => continue,
                Err(ConvertFail::Fault(e)) => return Err(e),
            }
        }
        Err(RuntimeError::raise(format!(
            "no overload of '{}' matches (arguments: {})",
            self.name,
            describe_frame_arguments(vm)
        )))
    }
}

fn describe_frame_arguments(vm: &Vm) -> String {
    let argc = vm.top();
    if argc == 0 {
        return "none".to_owned();
    }
    (1..=argc)
        .map(|i| {
            vm.value_at(i as i32)
                .map(|v| v.type_name())
                .unwrap_or("?")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Install a marshalled callable under `name` in `table`.
///
/// If the name already holds one of our dispatchers, the new callable joins
/// it as an overload candidate; otherwise a fresh slot and dispatcher
/// closure are installed (silently replacing any unrelated value, matching
/// the underlying set-field semantics).
pub fn install_function(table: &Rc<Table>, name: &str, marshalled: MarshalledFn) {
    let key = TableKey::str(name);
    if let Value::Function(existing) = table.raw_get(&key)
        && let Some(data) = existing.data()
        && let Ok(slot) = data.clone().downcast::<FunctionSlot>()
    {
        slot.add_candidate(marshalled);
        return;
    }

    let slot = FunctionSlot::new(name, marshalled);
    let dispatching = slot.clone();
    let dispatcher =
        NativeFunction::with_data(move |vm: &Vm| dispatching.dispatch(vm), slot);
    table.raw_set(key, Value::Function(dispatcher));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{BoundFunction, CallPolicy};

    fn marshal<Args>(f: impl BoundFunction<Args>) -> MarshalledFn {
        f.into_marshalled(CallPolicy::Normal)
    }

    #[test]
    fn single_entry_dispatches() {
        let vm = Vm::new();
        let slot = FunctionSlot::new("inc", marshal(|a: i64| a + 1));
        vm.push(Value::Int(4));
        assert_eq!(slot.dispatch(&vm).unwrap(), 1);
        assert_eq!(vm.value_at(-1).unwrap(), Value::Int(5));
        vm.pop(2);
    }

    #[test]
    fn promotion_keeps_registration_order() {
        let vm = Vm::new();
        let slot = FunctionSlot::new(
            "add",
            marshal(|a: String, b: String| format!("{a}{b}")),
        );
        slot.add_candidate(marshal(|a: f64, b: f64| a + b));
        assert_eq!(slot.candidate_count(), 2);

        vm.push(Value::Int(2));
        vm.push(Value::Int(5));
        slot.dispatch(&vm).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::Float(7.0));
        vm.pop(3);

        vm.push(Value::str("a"));
        vm.push(Value::str("b"));
        slot.dispatch(&vm).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::str("ab"));
        vm.pop(3);
    }

    #[test]
    fn first_match_wins_among_ambiguous_candidates() {
        let vm = Vm::new();
        // Both candidates accept an int; the first registered must win.
        let slot = FunctionSlot::new("pick", marshal(|_: i64| "first"));
        slot.add_candidate(marshal(|_: i64| "second"));

        vm.push(Value::Int(0));
        slot.dispatch(&vm).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::str("first"));
        vm.pop(2);
    }

    #[test]
    fn exhausted_candidates_name_argument_types() {
        let vm = Vm::new();
        let slot = FunctionSlot::new("add", marshal(|a: f64, b: f64| a + b));
        vm.push(Value::Int(2));
        vm.push(Value::str("bcd5"));
        let err = slot.dispatch(&vm).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("add"));
        assert!(message.contains("int"));
        assert!(message.contains("string"));
        vm.pop(2);
    }

    #[test]
    fn no_argument_error_reads_none() {
        let vm = Vm::new();
        let slot = FunctionSlot::new("f", marshal(|a: i64| a));
        let err = slot.dispatch(&vm).unwrap_err();
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn install_promotes_behind_the_same_closure() {
        let vm = Vm::new();
        let table = vm.globals();
        install_function(&table, "add", marshal(|a: i64, b: i64| a + b));
        let first = table.raw_get(&TableKey::str("add"));
        install_function(
            &table,
            "add",
            marshal(|a: String, b: String| format!("{a}{b}")),
        );
        let second = table.raw_get(&TableKey::str("add"));
        // The boundary-visible closure object must be unchanged.
        assert_eq!(first, second);

        vm.push(first);
        vm.push(Value::str("x"));
        vm.push(Value::str("y"));
        vm.pcall(2, Some(1)).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::str("xy"));
        vm.pop(1);
    }
}
