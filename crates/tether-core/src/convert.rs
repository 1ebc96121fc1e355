//! Per-type conversion between native values and boundary stack slots.
//!
//! Conversion is selected at compile time, one strategy per native type:
//!
//! 1. explicit built-ins: integers, floats, `bool`, `String`, raw [`Value`]
//!    passthrough, and the handle types (implemented in the facade crate);
//! 2. pointer-to-class: receivers pulled through [`pull_class_pointer`]
//!    by the method marshaller;
//! 3. by-value class fallback: blanket impls over the [`Scripted`] marker
//!    that clone out of (pulls) or heap-allocate into (pushes) an
//!    ownership-tagged opaque block.
//!
//! Pulling either fully consumes a value and reports how many slots it took,
//! or reports [`ConvertFail::Mismatch`] without destructive stack mutation,
//! the soft failure that drives overload fallthrough. Hard failures carry a
//! [`RuntimeError`] and propagate to the boundary.

use std::any::Any;

use tether_runtime::{RuntimeError, Value, Vm, VmOptions};

use crate::class_info::binder_state;
use crate::error::ConversionError;
use crate::ownership::{Ownership, TaggedBlock};

/// Failure modes of a pull.
#[derive(Debug)]
pub enum ConvertFail {
    /// The boundary value's dynamic type is incompatible. Soft: overload
    /// resolution moves on to the next candidate.
    Mismatch,
    /// A hard error to surface at the boundary.
    Fault(RuntimeError),
}

/// Result of pulling one logical value: the storage form plus the number of
/// stack slots consumed.
pub type Pulled<S> = Result<(S, u32), ConvertFail>;

/// Pull side of a conversion.
pub trait FromStack: Sized {
    /// Holds a pulled-but-not-yet-forwarded argument.
    type Storage;

    /// Whether this type converts to plain scalars (no ownership tagging).
    const PRIMITIVE: bool;

    /// Read one logical value starting at `index`.
    fn from_stack(vm: &Vm, index: i32) -> Pulled<Self::Storage>;

    /// Convert storage form into the exact parameter type.
    fn forward(storage: Self::Storage) -> Self;
}

/// Push side of a conversion.
pub trait ToStack {
    /// Whether this type converts to plain scalars (no ownership tagging).
    const PRIMITIVE: bool;

    /// Write the value onto the boundary stack, returning the slot count.
    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError>;
}

/// Marker for native types bound as classes.
///
/// Implementing it opts a type into the class conversion strategy; the
/// boundary-side metatable comes from class registration.
pub trait Scripted: Any + Sized {}

// ---------------------------------------------------------------------------
// Integers
// ---------------------------------------------------------------------------

/// Numeric coercion shared by the integral pulls: ints convert directly,
/// floats only when they carry no fractional part.
fn coerce_integral(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Float(f)
            if f.is_finite()
                && f.fract() == 0.0
                && *f >= i64::MIN as f64
                && *f <= i64::MAX as f64 =>
        {
            Some(*f as i64)
        }
        _ => None,
    }
}

macro_rules! impl_convert_integral {
    ($($ty:ty),*) => {$(
        impl FromStack for $ty {
            type Storage = $ty;
            const PRIMITIVE: bool = true;

            fn from_stack(vm: &Vm, index: i32) -> Pulled<$ty> {
                let value = vm.value_at(index).map_err(ConvertFail::Fault)?;
                let Some(wide) = coerce_integral(&value) else {
                    return Err(ConvertFail::Mismatch);
                };
                let narrowed = wide as $ty;
                if narrowed as i64 != wide
                    && vm.options().contains(VmOptions::CHECK_INTEGER_OVERFLOW)
                {
                    return Err(ConvertFail::Fault(
                        ConversionError::IntegerOverflow {
                            value: wide,
                            target: stringify!($ty),
                        }
                        .into(),
                    ));
                }
                // Out-of-range values silently truncate by default.
                Ok((narrowed, 1))
            }

            fn forward(storage: $ty) -> $ty {
                storage
            }
        }

        impl ToStack for $ty {
            const PRIMITIVE: bool = true;

            fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
                vm.push(Value::Int(self as i64));
                Ok(1)
            }
        }
    )*};
}

impl_convert_integral!(i8, i16, i32, i64, u8, u16, u32);

// u64 reinterprets bits through i64, preserving the full range.
impl FromStack for u64 {
    type Storage = u64;
    const PRIMITIVE: bool = true;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<u64> {
        let value = vm.value_at(index).map_err(ConvertFail::Fault)?;
        match coerce_integral(&value) {
            Some(wide) => Ok((wide as u64, 1)),
            None => Err(ConvertFail::Mismatch),
        }
    }

    fn forward(storage: u64) -> u64 {
        storage
    }
}

impl ToStack for u64 {
    const PRIMITIVE: bool = true;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        vm.push(Value::Int(self as i64));
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Floats
// ---------------------------------------------------------------------------

macro_rules! impl_convert_float {
    ($($ty:ty),*) => {$(
        impl FromStack for $ty {
            type Storage = $ty;
            const PRIMITIVE: bool = true;

            fn from_stack(vm: &Vm, index: i32) -> Pulled<$ty> {
                match vm.value_at(index).map_err(ConvertFail::Fault)? {
                    Value::Float(f) => Ok((f as $ty, 1)),
                    Value::Int(v) => Ok((v as $ty, 1)),
                    _ => Err(ConvertFail::Mismatch),
                }
            }

            fn forward(storage: $ty) -> $ty {
                storage
            }
        }

        impl ToStack for $ty {
            const PRIMITIVE: bool = true;

            fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
                vm.push(Value::Float(self as f64));
                Ok(1)
            }
        }
    )*};
}

impl_convert_float!(f32, f64);

// ---------------------------------------------------------------------------
// Bool
// ---------------------------------------------------------------------------

impl FromStack for bool {
    type Storage = bool;
    const PRIMITIVE: bool = true;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<bool> {
        match vm.value_at(index).map_err(ConvertFail::Fault)? {
            Value::Bool(b) => Ok((b, 1)),
            _ => Err(ConvertFail::Mismatch),
        }
    }

    fn forward(storage: bool) -> bool {
        storage
    }
}

impl ToStack for bool {
    const PRIMITIVE: bool = true;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        vm.push(Value::Bool(self));
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

// The dynamic type must be exactly "string": numbers are NOT coerced into
// strings, even though numbers coerce between themselves. The asymmetry is
// intentional and matches common embedded-language semantics; rely on it
// deliberately, not by accident.
impl FromStack for String {
    type Storage = String;
    const PRIMITIVE: bool = true;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<String> {
        match vm.value_at(index).map_err(ConvertFail::Fault)? {
            Value::Str(s) => Ok((s.to_string(), 1)),
            _ => Err(ConvertFail::Mismatch),
        }
    }

    fn forward(storage: String) -> String {
        storage
    }
}

impl ToStack for String {
    const PRIMITIVE: bool = true;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        vm.push(Value::str(&self));
        Ok(1)
    }
}

impl ToStack for &str {
    const PRIMITIVE: bool = true;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        vm.push(Value::str(self));
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Unit (void)
// ---------------------------------------------------------------------------

// A "no value" return: pushes nothing, costs nothing. Pulling accepts nil
// (what a protected call pads with when a callee returned nothing).
impl FromStack for () {
    type Storage = ();
    const PRIMITIVE: bool = true;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<()> {
        match vm.value_at(index).map_err(ConvertFail::Fault)? {
            Value::Nil => Ok(((), 1)),
            _ => Err(ConvertFail::Mismatch),
        }
    }

    fn forward(_storage: ()) {}
}

impl ToStack for () {
    const PRIMITIVE: bool = true;

    fn to_stack(self, _vm: &Vm) -> Result<u32, RuntimeError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Raw slot passthrough
// ---------------------------------------------------------------------------

impl FromStack for Value {
    type Storage = Value;
    const PRIMITIVE: bool = false;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<Value> {
        Ok((vm.value_at(index).map_err(ConvertFail::Fault)?, 1))
    }

    fn forward(storage: Value) -> Value {
        storage
    }
}

impl ToStack for Value {
    const PRIMITIVE: bool = false;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        vm.push(self);
        Ok(1)
    }
}

/// Consumes any one slot without converting it. Constructor trampolines use
/// it to swallow the class object that arrives as the first call argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignored;

impl FromStack for Ignored {
    type Storage = Ignored;
    const PRIMITIVE: bool = false;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<Ignored> {
        vm.value_at(index).map_err(ConvertFail::Fault)?;
        Ok((Ignored, 1))
    }

    fn forward(storage: Ignored) -> Ignored {
        storage
    }
}

// ---------------------------------------------------------------------------
// Class conversions
// ---------------------------------------------------------------------------

/// Pull a class pointer out of the opaque block at `index`.
///
/// The block's stamped type hash must match the registered representation of
/// `T`; anything else (wrong dynamic type, foreign block, unregistered
/// class) is a soft mismatch so overloads can fall through.
pub fn pull_class_pointer<T: Scripted>(vm: &Vm, index: i32) -> Pulled<*mut T> {
    let value = vm.value_at(index).map_err(ConvertFail::Fault)?;
    let Value::UserData(ud) = value else {
        return Err(ConvertFail::Mismatch);
    };
    let Some(block) = ud.with_payload(|p| p.downcast_ref::<TaggedBlock>().copied()) else {
        return Err(ConvertFail::Mismatch);
    };
    let Some(state) = binder_state(vm) else {
        return Err(ConvertFail::Mismatch);
    };
    let Some(rep) = state.classes.representation::<T>() else {
        return Err(ConvertFail::Mismatch);
    };
    if block.type_hash() != rep.type_hash() {
        return Err(ConvertFail::Mismatch);
    }
    Ok((block.pointer() as *mut T, 1))
}

/// Wrap a class pointer in a fresh opaque block, attach the class's instance
/// metatable, and push the result.
pub fn push_class_pointer<T: Scripted>(
    vm: &Vm,
    ptr: *mut T,
    ownership: Ownership,
) -> Result<u32, RuntimeError> {
    let state = binder_state(vm)
        .ok_or_else(|| RuntimeError::raise("binding layer is not open for this runtime"))?;
    let rep = state.classes.representation::<T>().ok_or_else(|| {
        RuntimeError::raise(format!(
            "type {} is not registered as a class",
            std::any::type_name::<T>()
        ))
    })?;
    let Value::Table(metatable) = vm.registry_get(rep.instance_key())? else {
        return Err(RuntimeError::raise(format!(
            "instance metatable slot for '{}' does not hold a table",
            rep.name()
        )));
    };
    let block = TaggedBlock::new(ptr.cast(), ownership, rep.type_hash());
    let userdata = vm.new_userdata(Box::new(block), Some(metatable));
    vm.push(userdata);
    Ok(1)
}

/// Move a native value to the boundary: heap-allocate it and push the
/// pointer as Owned, so the boundary's finalizer deletes it at collection.
pub fn push_class_value<T: Scripted>(vm: &Vm, value: T) -> Result<u32, RuntimeError> {
    push_class_pointer(vm, Box::into_raw(Box::new(value)), Ownership::Owned)
}

// By-value class fallback: pulling clones out of the block (the boundary
// keeps its instance), pushing heap-allocates an Owned copy.
impl<T: Scripted + Clone> FromStack for T {
    type Storage = *mut T;
    const PRIMITIVE: bool = false;

    fn from_stack(vm: &Vm, index: i32) -> Pulled<*mut T> {
        pull_class_pointer::<T>(vm, index)
    }

    fn forward(storage: *mut T) -> T {
        // Safety: the pointer was type-checked against the registered class
        // and the backing block stays anchored on the stack for the whole
        // call frame.
        unsafe { (&*storage).clone() }
    }
}

impl<T: Scripted> ToStack for T {
    const PRIMITIVE: bool = false;

    fn to_stack(self, vm: &Vm) -> Result<u32, RuntimeError> {
        push_class_value(vm, self)
    }
}
