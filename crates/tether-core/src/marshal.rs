//! Call marshalling: native callables become boundary-invocable closures.
//!
//! Arity and parameter types come from the callable's signature. At
//! invocation, arguments are pulled in parameter order starting at slot 1;
//! the first mismatch aborts immediately (remaining parameters are not
//! attempted) and reports soft failure so overload resolution can try the
//! next candidate. On success every storage value is forwarded into the
//! exact parameter type and the callable runs; the return value goes back
//! through its own conversion unless a call policy overrides it.

use tether_runtime::Vm;

use crate::class_info::binder_state;
use crate::convert::{ConvertFail, FromStack, Ignored, Scripted, ToStack, push_class_value};

/// How a marshalled call treats its return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPolicy {
    /// Convert and push the callable's return value.
    #[default]
    Normal,
    /// Re-push the first argument (the receiver) instead of the return
    /// value; the conversion of the real return is skipped entirely.
    ReturnSelf,
    /// Discard the return value and push nothing.
    IgnoreReturn,
}

/// A marshalled native callable: pulls its arguments off the boundary
/// stack, invokes the native code, pushes the result.
pub struct MarshalledFn {
    invoke: Box<dyn Fn(&Vm) -> Result<u32, ConvertFail>>,
}

impl MarshalledFn {
    pub fn new(invoke: impl Fn(&Vm) -> Result<u32, ConvertFail> + 'static) -> MarshalledFn {
        MarshalledFn {
            invoke: Box::new(invoke),
        }
    }

    /// Run against the current frame. `Ok` is the number of results pushed;
    /// `Err(Mismatch)` means the frame did not fit this candidate's
    /// signature and the stack is untouched.
    pub fn invoke(&self, vm: &Vm) -> Result<u32, ConvertFail> {
        (self.invoke)(vm)
    }
}

impl std::fmt::Debug for MarshalledFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshalledFn").finish_non_exhaustive()
    }
}

fn note_pulls(vm: &Vm, slots: u32) {
    if let Some(state) = binder_state(vm) {
        state.statistics.note_pulls(slots as u64);
    }
}

fn finish_call<R: ToStack>(vm: &Vm, ret: R, policy: CallPolicy) -> Result<u32, ConvertFail> {
    match policy {
        CallPolicy::Normal => {
            let pushed = ret.to_stack(vm).map_err(ConvertFail::Fault)?;
            if let Some(state) = binder_state(vm) {
                state.statistics.note_pushes(pushed as u64);
            }
            Ok(pushed)
        }
        CallPolicy::IgnoreReturn => Ok(0),
        CallPolicy::ReturnSelf => {
            vm.push_value_at(1).map_err(ConvertFail::Fault)?;
            Ok(1)
        }
    }
}

/// Free functions and function objects bindable as boundary closures.
///
/// `Args` is the parameter tuple, inferred from the callable's signature.
pub trait BoundFunction<Args>: 'static {
    fn into_marshalled(self, policy: CallPolicy) -> MarshalledFn;
}

macro_rules! impl_bound_function {
    ($count:expr $(, $arg:ident)*) => {
        impl<Fun, Ret $(, $arg)*> BoundFunction<($($arg,)*)> for Fun
        where
            Fun: Fn($($arg),*) -> Ret + 'static,
            Ret: ToStack + 'static,
            $($arg: FromStack + 'static,)*
        {
            fn into_marshalled(self, policy: CallPolicy) -> MarshalledFn {
                MarshalledFn::new(move |vm| {
                    if vm.top() != $count {
                        return Err(ConvertFail::Mismatch);
                    }
                    #[allow(unused_mut, unused_variables)]
                    let mut index: i32 = 1;
                    $(
                        #[allow(non_snake_case)]
                        let ($arg, consumed) = <$arg as FromStack>::from_stack(vm, index)?;
                        index += consumed as i32;
                    )*
                    let _ = index;
                    note_pulls(vm, $count);
                    let ret = (self)($(<$arg as FromStack>::forward($arg)),*);
                    finish_call(vm, ret, policy)
                })
            }
        }
    };
}

impl_bound_function!(0);
impl_bound_function!(1, A0);
impl_bound_function!(2, A0, A1);
impl_bound_function!(3, A0, A1, A2);
impl_bound_function!(4, A0, A1, A2, A3);
impl_bound_function!(5, A0, A1, A2, A3, A4);
impl_bound_function!(6, A0, A1, A2, A3, A4, A5);
impl_bound_function!(7, A0, A1, A2, A3, A4, A5, A6);
impl_bound_function!(8, A0, A1, A2, A3, A4, A5, A6, A7);
impl_bound_function!(9, A0, A1, A2, A3, A4, A5, A6, A7, A8);
impl_bound_function!(10, A0, A1, A2, A3, A4, A5, A6, A7, A8, A9);

/// Marker: the receiver is taken by shared reference.
pub struct ByRef;
/// Marker: the receiver is taken by mutable reference.
pub struct ByMut;

/// Member functions bindable as boundary closures.
///
/// Argument 0 of the boundary call is the receiver, pulled through the
/// class-pointer conversion and dispatched through the borrow; the `Marker`
/// tuple records the receiver's mutability alongside the parameter types.
pub trait BoundMethod<T, Marker>: 'static {
    fn into_marshalled_method(self, policy: CallPolicy) -> MarshalledFn;
}

macro_rules! impl_bound_method {
    ($count:expr $(, $arg:ident)*) => {
        impl<Fun, T, Ret $(, $arg)*> BoundMethod<T, (ByRef, $($arg,)*)> for Fun
        where
            T: Scripted,
            Fun: Fn(&T $(, $arg)*) -> Ret + 'static,
            Ret: ToStack + 'static,
            $($arg: FromStack + 'static,)*
        {
            fn into_marshalled_method(self, policy: CallPolicy) -> MarshalledFn {
                MarshalledFn::new(move |vm| {
                    if vm.top() != $count + 1 {
                        return Err(ConvertFail::Mismatch);
                    }
                    let (receiver, consumed) =
                        crate::convert::pull_class_pointer::<T>(vm, 1)?;
                    #[allow(unused_mut, unused_variables)]
                    let mut index: i32 = 1 + consumed as i32;
                    $(
                        #[allow(non_snake_case)]
                        let ($arg, consumed) = <$arg as FromStack>::from_stack(vm, index)?;
                        index += consumed as i32;
                    )*
                    let _ = index;
                    note_pulls(vm, $count + 1);
                    // Safety: the receiver's block stays anchored on the
                    // stack for the whole call frame.
                    let ret = (self)(unsafe { &*receiver } $(, <$arg as FromStack>::forward($arg))*);
                    finish_call(vm, ret, policy)
                })
            }
        }

        impl<Fun, T, Ret $(, $arg)*> BoundMethod<T, (ByMut, $($arg,)*)> for Fun
        where
            T: Scripted,
            Fun: Fn(&mut T $(, $arg)*) -> Ret + 'static,
            Ret: ToStack + 'static,
            $($arg: FromStack + 'static,)*
        {
            fn into_marshalled_method(self, policy: CallPolicy) -> MarshalledFn {
                MarshalledFn::new(move |vm| {
                    if vm.top() != $count + 1 {
                        return Err(ConvertFail::Mismatch);
                    }
                    let (receiver, consumed) =
                        crate::convert::pull_class_pointer::<T>(vm, 1)?;
                    #[allow(unused_mut, unused_variables)]
                    let mut index: i32 = 1 + consumed as i32;
                    $(
                        #[allow(non_snake_case)]
                        let ($arg, consumed) = <$arg as FromStack>::from_stack(vm, index)?;
                        index += consumed as i32;
                    )*
                    let _ = index;
                    note_pulls(vm, $count + 1);
                    // Safety: as above; the marshaller is the only borrower
                    // for the duration of the call.
                    let ret = (self)(unsafe { &mut *receiver } $(, <$arg as FromStack>::forward($arg))*);
                    finish_call(vm, ret, policy)
                })
            }
        }
    };
}

impl_bound_method!(0);
impl_bound_method!(1, A0);
impl_bound_method!(2, A0, A1);
impl_bound_method!(3, A0, A1, A2);
impl_bound_method!(4, A0, A1, A2, A3);
impl_bound_method!(5, A0, A1, A2, A3, A4);
impl_bound_method!(6, A0, A1, A2, A3, A4, A5);
impl_bound_method!(7, A0, A1, A2, A3, A4, A5, A6);
impl_bound_method!(8, A0, A1, A2, A3, A4, A5, A6, A7);

/// Factory callables bindable as class constructors.
///
/// The boundary invokes a class object like a function, so argument 0 is
/// the class object itself, swallowed via [`Ignored`], and the factory's
/// parameters start at slot 2. The constructed value is pushed as an Owned
/// pointer: the boundary's finalizer deletes it, exactly once, at
/// collection time.
pub trait BoundConstructor<T, Args>: 'static {
    fn into_marshalled_constructor(self) -> MarshalledFn;
}

macro_rules! impl_bound_constructor {
    ($count:expr $(, $arg:ident)*) => {
        impl<Fun, T $(, $arg)*> BoundConstructor<T, ($($arg,)*)> for Fun
        where
            T: Scripted,
            Fun: Fn($($arg),*) -> T + 'static,
            $($arg: FromStack + 'static,)*
        {
            fn into_marshalled_constructor(self) -> MarshalledFn {
                MarshalledFn::new(move |vm| {
                    if vm.top() != $count + 1 {
                        return Err(ConvertFail::Mismatch);
                    }
                    let (_, consumed) = Ignored::from_stack(vm, 1)?;
                    #[allow(unused_mut, unused_variables)]
                    let mut index: i32 = 1 + consumed as i32;
                    $(
                        #[allow(non_snake_case)]
                        let ($arg, consumed) = <$arg as FromStack>::from_stack(vm, index)?;
                        index += consumed as i32;
                    )*
                    let _ = index;
                    note_pulls(vm, $count);
                    let value = (self)($(<$arg as FromStack>::forward($arg)),*);
                    push_class_value(vm, value).map_err(ConvertFail::Fault)
                })
            }
        }
    };
}

impl_bound_constructor!(0);
impl_bound_constructor!(1, A0);
impl_bound_constructor!(2, A0, A1);
impl_bound_constructor!(3, A0, A1, A2);
impl_bound_constructor!(4, A0, A1, A2, A3);
impl_bound_constructor!(5, A0, A1, A2, A3, A4);
impl_bound_constructor!(6, A0, A1, A2, A3, A4, A5);
