//! The runtime instance: value stack, globals, registry, dispatch.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::error::RuntimeError;
use crate::registry::{Registry, RegistryKey};
use crate::table::{Finalizer, Table};
use crate::userdata::UserData;
use crate::value::{TableKey, Value};

bitflags! {
    /// Per-instance runtime options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmOptions: u32 {
        /// Integral conversions raise a host-visible error on overflow
        /// instead of silently truncating.
        const CHECK_INTEGER_OVERFLOW = 1 << 0;
        /// Stack-discipline guards hard-fail even in release builds.
        const STACK_ASSERTS = 1 << 1;
    }
}

struct VmState {
    stack: Vec<Value>,
    /// 0-based offset of the current frame's slot 1.
    frame_base: usize,
    globals: Rc<Table>,
    registry: Registry,
    app_data: FxHashMap<TypeId, Rc<dyn Any>>,
    options: VmOptions,
}

/// A runtime instance.
///
/// `Vm` is a cheap handle over shared state; clones refer to the same
/// instance. The model is single-threaded and non-reentrant-by-default:
/// everything happens on the calling thread, and nested boundary calls
/// recurse on the native call stack. No method holds an internal borrow
/// across a callout, so native closures may freely re-enter.
#[derive(Clone)]
pub struct Vm {
    state: Rc<RefCell<VmState>>,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::empty())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        Vm {
            state: Rc::new(RefCell::new(VmState {
                stack: Vec::new(),
                frame_base: 0,
                globals: Rc::new(Table::new()),
                registry: Registry::new(),
                app_data: FxHashMap::default(),
                options,
            })),
        }
    }

    pub fn options(&self) -> VmOptions {
        self.state.borrow().options
    }

    /// True when both handles refer to the same runtime instance.
    pub fn same_instance(&self, other: &Vm) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    /// Height of the current frame.
    pub fn top(&self) -> usize {
        let st = self.state.borrow();
        st.stack.len() - st.frame_base
    }

    pub fn push(&self, value: Value) {
        self.state.borrow_mut().stack.push(value);
    }

    /// Pop `n` values off the current frame.
    pub fn pop(&self, n: usize) {
        let mut st = self.state.borrow_mut();
        let floor = st.frame_base;
        let len = st.stack.len();
        debug_assert!(len - floor >= n, "pop below the current frame");
        st.stack.truncate(len.saturating_sub(n).max(floor));
    }

    fn resolve(&self, index: i32) -> Result<usize, RuntimeError> {
        let st = self.state.borrow();
        let height = st.stack.len() - st.frame_base;
        let bad = || RuntimeError::BadIndex { index, height };
        if index > 0 {
            let pos = st.frame_base + index as usize - 1;
            if pos < st.stack.len() { Ok(pos) } else { Err(bad()) }
        } else if index < 0 {
            let off = (-index) as usize;
            if off <= height {
                Ok(st.stack.len() - off)
            } else {
                Err(bad())
            }
        } else {
            Err(bad())
        }
    }

    /// Read the value at a frame index (positive from the frame bottom,
    /// negative from the top).
    pub fn value_at(&self, index: i32) -> Result<Value, RuntimeError> {
        let pos = self.resolve(index)?;
        Ok(self.state.borrow().stack[pos].clone())
    }

    /// Push a copy of the value at `index` onto the top.
    pub fn push_value_at(&self, index: i32) -> Result<(), RuntimeError> {
        let v = self.value_at(index)?;
        self.push(v);
        Ok(())
    }

    /// Resolve a frame index into an absolute (1-based, frame-independent)
    /// stack position. Stack-anchored handles compute this exactly once.
    pub fn absolute(&self, index: i32) -> Result<usize, RuntimeError> {
        Ok(self.resolve(index)? + 1)
    }

    /// Read the value at an absolute position from [`Vm::absolute`].
    pub fn value_at_absolute(&self, position: usize) -> Result<Value, RuntimeError> {
        let st = self.state.borrow();
        if position == 0 || position > st.stack.len() {
            return Err(RuntimeError::BadIndex {
                index: position as i32,
                height: st.stack.len(),
            });
        }
        Ok(st.stack[position - 1].clone())
    }

    // ------------------------------------------------------------------
    // Globals and registry
    // ------------------------------------------------------------------

    pub fn globals(&self) -> Rc<Table> {
        self.state.borrow().globals.clone()
    }

    /// Anchor a value in the persistent registry.
    pub fn ref_value(&self, value: Value) -> RegistryKey {
        self.state.borrow_mut().registry.insert(value)
    }

    pub fn registry_get(&self, key: RegistryKey) -> Result<Value, RuntimeError> {
        self.state
            .borrow()
            .registry
            .get(key)
            .ok_or(RuntimeError::StaleRegistryKey)
    }

    pub fn unref(&self, key: RegistryKey) {
        self.state.borrow_mut().registry.remove(key);
    }

    // ------------------------------------------------------------------
    // App data
    // ------------------------------------------------------------------

    /// Attach per-instance host state, keyed by its type.
    pub fn set_app_data<T: Any>(&self, data: Rc<T>) {
        self.state
            .borrow_mut()
            .app_data
            .insert(TypeId::of::<T>(), data);
    }

    pub fn app_data<T: Any>(&self) -> Option<Rc<T>> {
        let data = self.state.borrow().app_data.get(&TypeId::of::<T>())?.clone();
        data.downcast::<T>().ok()
    }

    pub fn remove_app_data<T: Any>(&self) -> Option<Rc<T>> {
        let data = self
            .state
            .borrow_mut()
            .app_data
            .remove(&TypeId::of::<T>())?;
        data.downcast::<T>().ok()
    }

    // ------------------------------------------------------------------
    // Userdata
    // ------------------------------------------------------------------

    /// Create a userdata value. The metatable's registered finalizer, if
    /// any, is snapshotted into the instance.
    pub fn new_userdata(&self, payload: Box<dyn Any>, metatable: Option<Rc<Table>>) -> Value {
        Value::UserData(Rc::new(UserData::new(payload, metatable)))
    }

    /// Register the finalizer future instances of `metatable` will carry.
    pub fn register_finalizer(&self, metatable: &Rc<Table>, f: impl Fn(&mut dyn Any) + 'static) {
        let f: Rc<Finalizer> = Rc::new(f);
        metatable.set_finalizer(f);
    }

    // ------------------------------------------------------------------
    // Field access (metatable-aware)
    // ------------------------------------------------------------------

    /// Read `target[key]`, routing through `__index` when the raw lookup
    /// misses (tables) or unconditionally (userdata).
    pub fn get_field(&self, target: &Value, key: &TableKey) -> Result<Value, RuntimeError> {
        match target {
            Value::Table(t) => {
                let raw = t.raw_get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let Some(meta) = t.metatable() else {
                    return Ok(Value::Nil);
                };
                match meta.raw_get(&TableKey::str("__index")) {
                    Value::Nil => Ok(Value::Nil),
                    handler @ Value::Function(_) => {
                        self.call_index_handler(handler, target.clone(), key)
                    }
                    chained @ Value::Table(_) => self.get_field(&chained, key),
                    other => Err(RuntimeError::raise(format!(
                        "invalid __index handler of type {}",
                        other.type_name()
                    ))),
                }
            }
            Value::UserData(u) => {
                let handler = u
                    .metatable()
                    .map(|m| m.raw_get(&TableKey::str("__index")))
                    .unwrap_or(Value::Nil);
                match handler {
                    handler @ Value::Function(_) => {
                        self.call_index_handler(handler, target.clone(), key)
                    }
                    chained @ Value::Table(_) => self.get_field(&chained, key),
                    _ => Err(RuntimeError::NotIndexable {
                        kind: target.type_name(),
                    }),
                }
            }
            other => Err(RuntimeError::NotIndexable {
                kind: other.type_name(),
            }),
        }
    }

    /// Write `target[key] = value`, routing through `__newindex` when the
    /// raw lookup misses (tables) or unconditionally (userdata).
    pub fn set_field(
        &self,
        target: &Value,
        key: TableKey,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match target {
            Value::Table(t) => {
                if t.contains(&key) {
                    t.raw_set(key, value);
                    return Ok(());
                }
                let handler = t
                    .metatable()
                    .map(|m| m.raw_get(&TableKey::str("__newindex")))
                    .unwrap_or(Value::Nil);
                match handler {
                    Value::Nil => {
                        t.raw_set(key, value);
                        Ok(())
                    }
                    handler @ Value::Function(_) => {
                        self.call_newindex_handler(handler, target.clone(), key, value)
                    }
                    chained @ Value::Table(_) => self.set_field(&chained, key, value),
                    other => Err(RuntimeError::raise(format!(
                        "invalid __newindex handler of type {}",
                        other.type_name()
                    ))),
                }
            }
            Value::UserData(u) => {
                let handler = u
                    .metatable()
                    .map(|m| m.raw_get(&TableKey::str("__newindex")))
                    .unwrap_or(Value::Nil);
                match handler {
                    handler @ Value::Function(_) => {
                        self.call_newindex_handler(handler, target.clone(), key, value)
                    }
                    chained @ Value::Table(_) => self.set_field(&chained, key, value),
                    _ => Err(RuntimeError::NotIndexable {
                        kind: target.type_name(),
                    }),
                }
            }
            other => Err(RuntimeError::NotIndexable {
                kind: other.type_name(),
            }),
        }
    }

    fn call_index_handler(
        &self,
        handler: Value,
        target: Value,
        key: &TableKey,
    ) -> Result<Value, RuntimeError> {
        self.push(handler);
        self.push(target);
        self.push(key.to_value());
        self.pcall(2, Some(1))?;
        let result = self.value_at(-1)?;
        self.pop(1);
        Ok(result)
    }

    fn call_newindex_handler(
        &self,
        handler: Value,
        target: Value,
        key: TableKey,
        value: Value,
    ) -> Result<(), RuntimeError> {
        self.push(handler);
        self.push(target);
        self.push(key.to_value());
        self.push(value);
        self.pcall(3, Some(0))?;
        Ok(())
    }

    /// The "next key" primitive over a table value.
    pub fn next(
        &self,
        table: &Value,
        prev: Option<&TableKey>,
    ) -> Result<Option<(TableKey, Value)>, RuntimeError> {
        match table {
            Value::Table(t) => Ok(t.next(prev)),
            other => Err(RuntimeError::NotIndexable {
                kind: other.type_name(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Whether calling this value could succeed: a function, or anything
    /// whose metatable carries a `__call` handler.
    pub fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Function(_) => true,
            _ => matches!(self.call_handler(value), Some(Value::Function(_))),
        }
    }

    fn call_handler(&self, value: &Value) -> Option<Value> {
        let meta = match value {
            Value::Table(t) => t.metatable()?,
            Value::UserData(u) => u.metatable()?.clone(),
            _ => return None,
        };
        match meta.raw_get(&TableKey::str("__call")) {
            Value::Nil => None,
            handler => Some(handler),
        }
    }

    /// Protected call.
    ///
    /// Expects `[callee, arg1..argN]` on top of the stack; pops them, runs
    /// the callee with a fresh frame (its slot 1 is `arg1`), and pushes its
    /// results. With `Some(m)` the results are padded with nil or truncated
    /// to exactly `m`. On error the stack is restored to the pre-call height
    /// minus callee and arguments, and the error is returned as a value,
    /// never a crash.
    pub fn pcall(&self, nargs: u32, nresults: Option<u32>) -> Result<u32, RuntimeError> {
        let callee_pos = {
            let st = self.state.borrow();
            let height = st.stack.len() - st.frame_base;
            if height < nargs as usize + 1 {
                return Err(RuntimeError::BadIndex {
                    index: -(nargs as i32) - 1,
                    height,
                });
            }
            st.stack.len() - nargs as usize - 1
        };
        let callee = self.state.borrow().stack[callee_pos].clone();

        let function = match callee {
            Value::Function(f) => f,
            other => {
                // Route through __call with the original callee prepended.
                return match self.call_handler(&other) {
                    Some(handler) => {
                        self.state.borrow_mut().stack.insert(callee_pos, handler);
                        self.pcall(nargs + 1, nresults)
                    }
                    None => {
                        self.state.borrow_mut().stack.truncate(callee_pos);
                        Err(RuntimeError::NotCallable {
                            kind: other.type_name(),
                        })
                    }
                };
            }
        };

        let saved_base = {
            let mut st = self.state.borrow_mut();
            st.stack.remove(callee_pos);
            let saved = st.frame_base;
            st.frame_base = callee_pos;
            saved
        };

        let outcome = function.invoke(self);

        let mut st = self.state.borrow_mut();
        st.frame_base = saved_base;
        match outcome {
            Ok(returned) => {
                let returned = returned as usize;
                let len = st.stack.len();
                debug_assert!(
                    len >= callee_pos + returned,
                    "native closure reported more results than it pushed"
                );
                let junk_end = len.saturating_sub(returned).max(callee_pos);
                st.stack.drain(callee_pos..junk_end);
                drop(st);
                Ok(self.adjust_results(returned as u32, nresults))
            }
            Err(e) => {
                st.stack.truncate(callee_pos);
                Err(e)
            }
        }
    }

    fn adjust_results(&self, returned: u32, nresults: Option<u32>) -> u32 {
        let Some(wanted) = nresults else {
            return returned;
        };
        if returned < wanted {
            for _ in returned..wanted {
                self.push(Value::Nil);
            }
        } else if returned > wanted {
            self.pop((returned - wanted) as usize);
        }
        wanted
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Render the current frame's stack for debugging.
    pub fn stack_dump(&self) -> String {
        let st = self.state.borrow();
        let mut out = String::new();
        for (i, v) in st.stack[st.frame_base..].iter().enumerate() {
            let _ = write!(out, "[{}] {:?}  ", i + 1, v);
        }
        out
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Vm")
            .field("stack_height", &st.stack.len())
            .field("frame_base", &st.frame_base)
            .field("registry_len", &st.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::NativeFunction;

    #[test]
    fn push_pop_and_indexing() {
        let vm = Vm::new();
        vm.push(Value::Int(1));
        vm.push(Value::Int(2));
        vm.push(Value::Int(3));
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.value_at(1).unwrap(), Value::Int(1));
        assert_eq!(vm.value_at(-1).unwrap(), Value::Int(3));
        vm.pop(2);
        assert_eq!(vm.top(), 1);
        assert!(vm.value_at(2).is_err());
        assert!(vm.value_at(0).is_err());
    }

    #[test]
    fn absolute_positions_survive_pushes() {
        let vm = Vm::new();
        vm.push(Value::Int(10));
        let pos = vm.absolute(-1).unwrap();
        vm.push(Value::Int(20));
        vm.push(Value::Int(30));
        assert_eq!(vm.value_at_absolute(pos).unwrap(), Value::Int(10));
    }

    #[test]
    fn simple_call() {
        let vm = Vm::new();
        let add = NativeFunction::new(|vm| {
            let a = match vm.value_at(1)? {
                Value::Int(v) => v,
                _ => return Err(RuntimeError::raise("expected int")),
            };
            let b = match vm.value_at(2)? {
                Value::Int(v) => v,
                _ => return Err(RuntimeError::raise("expected int")),
            };
            vm.push(Value::Int(a + b));
            Ok(1)
        });
        vm.push(Value::Function(add));
        vm.push(Value::Int(2));
        vm.push(Value::Int(5));
        let n = vm.pcall(2, Some(1)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(vm.value_at(-1).unwrap(), Value::Int(7));
        vm.pop(1);
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn callee_sees_only_its_frame() {
        let vm = Vm::new();
        let probe = NativeFunction::new(|vm| {
            assert_eq!(vm.top(), 1);
            assert_eq!(vm.value_at(1)?, Value::Int(99));
            Ok(0)
        });
        vm.push(Value::str("below"));
        vm.push(Value::Function(probe));
        vm.push(Value::Int(99));
        vm.pcall(1, Some(0)).unwrap();
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.value_at(1).unwrap(), Value::str("below"));
    }

    #[test]
    fn pcall_restores_stack_on_error() {
        let vm = Vm::new();
        let fail = NativeFunction::new(|vm| {
            vm.push(Value::Int(1));
            vm.push(Value::Int(2));
            Err(RuntimeError::raise("boom"))
        });
        vm.push(Value::str("sentinel"));
        vm.push(Value::Function(fail));
        vm.push(Value::Int(0));
        let err = vm.pcall(1, Some(1)).unwrap_err();
        assert_eq!(err, RuntimeError::raise("boom"));
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.value_at(1).unwrap(), Value::str("sentinel"));
    }

    #[test]
    fn nested_calls_recurse() {
        let vm = Vm::new();
        let inner = NativeFunction::new(|vm| {
            vm.push(Value::Int(21));
            Ok(1)
        });
        let inner_value = Value::Function(inner);
        let outer = NativeFunction::new({
            let inner_value = inner_value.clone();
            move |vm| {
                vm.push(inner_value.clone());
                vm.pcall(0, Some(1))?;
                let v = match vm.value_at(-1)? {
                    Value::Int(v) => v,
                    _ => unreachable!(),
                };
                vm.pop(1);
                vm.push(Value::Int(v * 2));
                Ok(1)
            }
        });
        vm.push(Value::Function(outer));
        vm.pcall(0, Some(1)).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::Int(42));
        vm.pop(1);
    }

    #[test]
    fn call_through_call_handler() {
        let vm = Vm::new();
        let handler = NativeFunction::new(|vm| {
            // Slot 1 is the callee itself, slot 2 the first real argument.
            assert_eq!(vm.top(), 2);
            assert!(matches!(vm.value_at(1)?, Value::Table(_)));
            let arg = vm.value_at(2)?;
            vm.push(arg);
            Ok(1)
        });
        let meta = Rc::new(Table::new());
        meta.raw_set(TableKey::str("__call"), Value::Function(handler));
        let callee = Rc::new(Table::new());
        callee.set_metatable(Some(meta));

        vm.push(Value::Table(callee));
        vm.push(Value::Int(5));
        vm.pcall(1, Some(1)).unwrap();
        assert_eq!(vm.value_at(-1).unwrap(), Value::Int(5));
        vm.pop(1);
    }

    #[test]
    fn calling_uncallable_errors_and_cleans_up() {
        let vm = Vm::new();
        vm.push(Value::Int(3));
        vm.push(Value::Int(4));
        let err = vm.pcall(1, None).unwrap_err();
        assert_eq!(err, RuntimeError::NotCallable { kind: "int" });
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn result_adjustment_pads_and_truncates() {
        let vm = Vm::new();
        let two = NativeFunction::new(|vm| {
            vm.push(Value::Int(1));
            vm.push(Value::Int(2));
            Ok(2)
        });
        vm.push(Value::Function(two.clone()));
        vm.pcall(0, Some(3)).unwrap();
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.value_at(3).unwrap(), Value::Nil);
        vm.pop(3);

        vm.push(Value::Function(two));
        vm.pcall(0, Some(1)).unwrap();
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.value_at(1).unwrap(), Value::Int(1));
        vm.pop(1);
    }

    #[test]
    fn get_field_routes_through_index_function() {
        let vm = Vm::new();
        let handler = NativeFunction::new(|vm| {
            let key = vm.value_at(2)?;
            assert_eq!(key, Value::str("missing"));
            vm.push(Value::Int(7));
            Ok(1)
        });
        let meta = Rc::new(Table::new());
        meta.raw_set(TableKey::str("__index"), Value::Function(handler));
        let t = Rc::new(Table::new());
        t.raw_set(TableKey::str("present"), Value::Int(1));
        t.set_metatable(Some(meta));

        let tv = Value::Table(t);
        assert_eq!(
            vm.get_field(&tv, &TableKey::str("present")).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            vm.get_field(&tv, &TableKey::str("missing")).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn set_field_prefers_existing_keys() {
        let vm = Vm::new();
        let handler = NativeFunction::new(|_| panic!("__newindex must not run for existing keys"));
        let meta = Rc::new(Table::new());
        meta.raw_set(TableKey::str("__newindex"), Value::Function(handler));
        let t = Rc::new(Table::new());
        t.raw_set(TableKey::str("a"), Value::Int(1));
        t.set_metatable(Some(meta));

        let tv = Value::Table(t.clone());
        vm.set_field(&tv, TableKey::str("a"), Value::Int(2)).unwrap();
        assert_eq!(t.raw_get(&TableKey::str("a")), Value::Int(2));
    }

    #[test]
    fn app_data_roundtrip() {
        struct Marker(u32);
        let vm = Vm::new();
        vm.set_app_data(Rc::new(Marker(5)));
        assert_eq!(vm.app_data::<Marker>().unwrap().0, 5);
        let removed = vm.remove_app_data::<Marker>().unwrap();
        assert_eq!(removed.0, 5);
        assert!(vm.app_data::<Marker>().is_none());
    }

    #[test]
    fn registry_anchoring() {
        let vm = Vm::new();
        let key = vm.ref_value(Value::Int(9));
        vm.push(Value::Int(1));
        vm.pop(1);
        assert_eq!(vm.registry_get(key).unwrap(), Value::Int(9));
        vm.unref(key);
        assert!(vm.registry_get(key).is_err());
    }
}
