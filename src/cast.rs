//! Casting and calling through handles.

use tether_core::{ConversionError, ConvertFail, FromStack, StackGuard, ToStack};
use tether_runtime::{RuntimeError, Value, Vm};

use crate::object::{Object, StackObject};

/// Anything that can stand for a boundary value from native code.
pub trait BoundaryHandle {
    fn vm(&self) -> &Vm;

    /// The current boundary value behind the handle.
    fn value(&self) -> Result<Value, RuntimeError>;

    /// Push the value onto the stack.
    fn push_value(&self) -> Result<(), RuntimeError> {
        let value = self.value()?;
        self.vm().push(value);
        Ok(())
    }
}

impl BoundaryHandle for Object {
    fn vm(&self) -> &Vm {
        Object::vm(self)
    }

    fn value(&self) -> Result<Value, RuntimeError> {
        Object::value(self)
    }
}

impl BoundaryHandle for StackObject {
    fn vm(&self) -> &Vm {
        StackObject::vm(self)
    }

    fn value(&self) -> Result<Value, RuntimeError> {
        StackObject::value(self)
    }
}

/// Convert the handle's value into a native `V`.
pub fn cast<V: FromStack, H: BoundaryHandle>(handle: &H) -> Result<V, ConversionError> {
    let vm = handle.vm();
    let _guard = StackGuard::new(vm, 0, 0);
    handle.push_value()?;
    match V::from_stack(vm, -1) {
        Ok((storage, consumed)) => {
            // Forward before popping: the storage may point into the pushed
            // slot, and the pop could be its last reference.
            let value = V::forward(storage);
            vm.pop(consumed as usize);
            Ok(value)
        }
        Err(ConvertFail::Mismatch) => {
            vm.pop(1);
            Err(ConversionError::BadCast {
                target: std::any::type_name::<V>(),
            })
        }
        Err(ConvertFail::Fault(e)) => {
            vm.pop(1);
            Err(ConversionError::Runtime(e))
        }
    }
}

/// Argument pack for [`call`] / [`conditional_call`].
pub trait CallArgs {
    /// Push every argument, returning the slot count.
    fn push_args(self, vm: &Vm) -> Result<u32, RuntimeError>;
}

impl CallArgs for () {
    fn push_args(self, _vm: &Vm) -> Result<u32, RuntimeError> {
        Ok(0)
    }
}

macro_rules! impl_call_args {
    ($($arg:ident : $idx:tt),+) => {
        impl<$($arg: ToStack),+> CallArgs for ($($arg,)+) {
            fn push_args(self, vm: &Vm) -> Result<u32, RuntimeError> {
                let mut pushed = 0u32;
                $( pushed += self.$idx.to_stack(vm)?; )+
                Ok(pushed)
            }
        }
    };
}

impl_call_args!(A0: 0);
impl_call_args!(A0: 0, A1: 1);
impl_call_args!(A0: 0, A1: 1, A2: 2);
impl_call_args!(A0: 0, A1: 1, A2: 2, A3: 3);
impl_call_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_call_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
impl_call_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
impl_call_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);

/// Call the handle's value as a boundary closure with `args`, converting
/// the single result to `R`.
pub fn call<R: FromStack, A: CallArgs, H: BoundaryHandle>(
    handle: &H,
    args: A,
) -> Result<R, RuntimeError> {
    let vm = handle.vm();
    let _guard = StackGuard::new(vm, 0, 0);
    let entry = vm.top();
    let outcome = call_inner(vm, handle, args);
    if outcome.is_err() {
        let now = vm.top();
        if now > entry {
            vm.pop(now - entry);
        }
    }
    outcome
}

fn call_inner<R: FromStack, A: CallArgs, H: BoundaryHandle>(
    vm: &Vm,
    handle: &H,
    args: A,
) -> Result<R, RuntimeError> {
    handle.push_value()?;
    let nargs = args.push_args(vm)?;
    vm.pcall(nargs, Some(1))?;
    match R::from_stack(vm, -1) {
        Ok((storage, consumed)) => {
            // Forward before popping; see `cast`.
            let value = R::forward(storage);
            vm.pop(consumed as usize);
            Ok(value)
        }
        Err(ConvertFail::Mismatch) => {
            let actual = vm.value_at(-1)?.type_name();
            vm.pop(1);
            Err(RuntimeError::raise(format!(
                "call result is a {} value, not convertible to {}",
                actual,
                std::any::type_name::<R>()
            )))
        }
        Err(ConvertFail::Fault(e)) => {
            vm.pop(1);
            Err(e)
        }
    }
}

/// Like [`call`], but a handle that is not callable is a no-op yielding
/// `None` instead of an error.
pub fn conditional_call<R: FromStack, A: CallArgs, H: BoundaryHandle>(
    handle: &H,
    args: A,
) -> Result<Option<R>, RuntimeError> {
    let vm = handle.vm();
    let value = handle.value()?;
    if !vm.is_callable(&value) {
        return Ok(None);
    }
    call(handle, args).map(Some)
}
