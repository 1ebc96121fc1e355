//! Member descriptors: fields and properties routed by the class trampolines.
//!
//! A descriptor exposes `push` (read the member onto the stack) and `set`
//! (store the value at the top of the frame into the member); read-only
//! variants raise a host-visible error from `set`. Fields are described by
//! projection functions, the Rust analogue of member pointers.
//!
//! Field conversion strategy is chosen per field type by [`FieldGet`] /
//! [`FieldSet`]: primitives copy by value, while class-typed fields surface
//! as Unowned pointers into the enclosing object, so discarding them on the
//! boundary side never runs a destructor.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use tether_runtime::{RuntimeError, Vm};

use crate::convert::{
    ConvertFail, FromStack, Scripted, ToStack, pull_class_pointer, push_class_pointer,
};
use crate::ownership::Ownership;

/// Read strategy for a field of type `Self`.
pub trait FieldGet: 'static {
    /// Push the field's boundary representation.
    ///
    /// # Safety contract
    /// `field` must point into a live object that outlives the call.
    fn push_field(vm: &Vm, field: *mut Self) -> Result<u32, RuntimeError>;
}

/// Write strategy for a field of type `Self`.
pub trait FieldSet: FieldGet {
    /// Store the boundary value at `index` into the field, returning the
    /// slot count consumed. Incompatible values raise a host-visible error
    /// (assignment has no overload fallthrough to soft-fail into).
    fn store_field(vm: &Vm, index: i32, field: *mut Self) -> Result<u32, RuntimeError>;
}

macro_rules! impl_field_primitive {
    ($($ty:ty),*) => {$(
        impl FieldGet for $ty {
            fn push_field(vm: &Vm, field: *mut $ty) -> Result<u32, RuntimeError> {
                // Safety: per the trait contract the pointer targets a live
                // field for the duration of the call.
                unsafe { (&*field).clone() }.to_stack(vm)
            }
        }

        impl FieldSet for $ty {
            fn store_field(vm: &Vm, index: i32, field: *mut $ty) -> Result<u32, RuntimeError> {
                match <$ty as FromStack>::from_stack(vm, index) {
                    Ok((storage, consumed)) => {
                        // Safety: as above.
                        unsafe { *field = <$ty as FromStack>::forward(storage) };
                        Ok(consumed)
                    }
                    Err(ConvertFail::Mismatch) => {
                        let actual = vm
                            .value_at(index)
                            .map(|v| v.type_name())
                            .unwrap_or("nothing");
                        Err(RuntimeError::raise(format!(
                            "cannot assign a {} value to a {} member",
                            actual,
                            stringify!($ty)
                        )))
                    }
                    Err(ConvertFail::Fault(e)) => Err(e),
                }
            }
        }
    )*};
}

impl_field_primitive!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, String);

// Class-typed fields surface as Unowned pointers into the enclosing object:
// the native side owns the lifetime, the boundary's finalizer never fires.
impl<T: Scripted> FieldGet for T {
    fn push_field(vm: &Vm, field: *mut T) -> Result<u32, RuntimeError> {
        push_class_pointer(vm, field, Ownership::Unowned)
    }
}

impl<T: Scripted + Clone> FieldSet for T {
    fn store_field(vm: &Vm, index: i32, field: *mut T) -> Result<u32, RuntimeError> {
        match pull_class_pointer::<T>(vm, index) {
            Ok((source, consumed)) => {
                // Safety: both pointers were type-checked and target live
                // objects anchored for the duration of the call.
                unsafe { *field = (&*source).clone() };
                Ok(consumed)
            }
            Err(ConvertFail::Mismatch) => {
                let actual = vm
                    .value_at(index)
                    .map(|v| v.type_name())
                    .unwrap_or("nothing");
                Err(RuntimeError::raise(format!(
                    "cannot assign a {} value to a {} member",
                    actual,
                    std::any::type_name::<T>()
                )))
            }
            Err(ConvertFail::Fault(e)) => Err(e),
        }
    }
}

/// A registered field or property.
pub trait Member: 'static {
    /// Push the member's value for the given target object.
    fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError>;

    /// Store the value at the top of the frame into the member, returning
    /// the consumed slot count. Read-only members raise.
    fn set(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError>;
}

/// The opaque value stored in a class's member table for descriptors.
///
/// Wrapping the trait object in one concrete type lets the trampolines
/// recover it from an opaque slot with a plain downcast.
pub struct MemberSlot(Box<dyn Member>);

impl MemberSlot {
    pub fn new(member: impl Member) -> Rc<MemberSlot> {
        Rc::new(MemberSlot(Box::new(member)))
    }

    pub fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        self.0.push(vm, target)
    }

    pub fn set(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        self.0.set(vm, target)
    }

    /// Recover a descriptor from an opaque slot value.
    pub fn from_opaque(value: &Rc<dyn Any>) -> Option<Rc<MemberSlot>> {
        value.clone().downcast::<MemberSlot>().ok()
    }
}

fn read_only_error() -> RuntimeError {
    RuntimeError::raise("cannot set a read-only member")
}

/// A field exposed for reading only.
///
/// The projection is a plain function pointer so its lifetimes stay fully
/// general; field projections are usually small named functions.
pub struct ReadOnlyField<T, F> {
    projection: fn(&T) -> &F,
}

impl<T, F> ReadOnlyField<T, F>
where
    T: Scripted,
    F: FieldGet,
{
    pub fn new(projection: fn(&T) -> &F) -> ReadOnlyField<T, F> {
        ReadOnlyField { projection }
    }
}

impl<T, F> Member for ReadOnlyField<T, F>
where
    T: Scripted,
    F: FieldGet,
{
    fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        // Safety: the trampoline resolved and type-checked the target.
        let object = unsafe { &*(target as *mut T) };
        let field = (self.projection)(object) as *const F as *mut F;
        F::push_field(vm, field)
    }

    fn set(&self, _vm: &Vm, _target: *mut ()) -> Result<u32, RuntimeError> {
        Err(read_only_error())
    }
}

/// A field exposed for reading and writing.
pub struct ReadWriteField<T, F> {
    projection: fn(&mut T) -> &mut F,
}

impl<T, F> ReadWriteField<T, F>
where
    T: Scripted,
    F: FieldSet,
{
    pub fn new(projection: fn(&mut T) -> &mut F) -> ReadWriteField<T, F> {
        ReadWriteField { projection }
    }
}

impl<T, F> Member for ReadWriteField<T, F>
where
    T: Scripted,
    F: FieldSet,
{
    fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        // Safety: the trampoline resolved and type-checked the target.
        let object = unsafe { &mut *(target as *mut T) };
        let field = (self.projection)(object) as *mut F;
        F::push_field(vm, field)
    }

    fn set(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        // Safety: as above.
        let object = unsafe { &mut *(target as *mut T) };
        let field = (self.projection)(object) as *mut F;
        F::store_field(vm, -1, field)
    }
}

/// A computed member backed by a getter only.
pub struct ReadOnlyProperty<T, V, G> {
    getter: G,
    _marker: PhantomData<fn() -> (T, V)>,
}

impl<T, V, G> ReadOnlyProperty<T, V, G>
where
    T: Scripted,
    V: ToStack + 'static,
    G: Fn(&T) -> V + 'static,
{
    pub fn new(getter: G) -> ReadOnlyProperty<T, V, G> {
        ReadOnlyProperty {
            getter,
            _marker: PhantomData,
        }
    }
}

impl<T, V, G> Member for ReadOnlyProperty<T, V, G>
where
    T: Scripted,
    V: ToStack + 'static,
    G: Fn(&T) -> V + 'static,
{
    fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        // Safety: the trampoline resolved and type-checked the target.
        let object = unsafe { &*(target as *mut T) };
        (self.getter)(object).to_stack(vm)
    }

    fn set(&self, _vm: &Vm, _target: *mut ()) -> Result<u32, RuntimeError> {
        Err(read_only_error())
    }
}

/// A computed member backed by a getter/setter pair.
pub struct ReadWriteProperty<T, V, G, S> {
    getter: G,
    setter: S,
    _marker: PhantomData<fn() -> (T, V)>,
}

impl<T, V, G, S> ReadWriteProperty<T, V, G, S>
where
    T: Scripted,
    V: ToStack + FromStack + 'static,
    G: Fn(&T) -> V + 'static,
    S: Fn(&mut T, V) + 'static,
{
    pub fn new(getter: G, setter: S) -> ReadWriteProperty<T, V, G, S> {
        ReadWriteProperty {
            getter,
            setter,
            _marker: PhantomData,
        }
    }
}

impl<T, V, G, S> Member for ReadWriteProperty<T, V, G, S>
where
    T: Scripted,
    V: ToStack + FromStack + 'static,
    G: Fn(&T) -> V + 'static,
    S: Fn(&mut T, V) + 'static,
{
    fn push(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        // Safety: the trampoline resolved and type-checked the target.
        let object = unsafe { &*(target as *mut T) };
        (self.getter)(object).to_stack(vm)
    }

    fn set(&self, vm: &Vm, target: *mut ()) -> Result<u32, RuntimeError> {
        match V::from_stack(vm, -1) {
            Ok((storage, consumed)) => {
                // Safety: as above.
                let object = unsafe { &mut *(target as *mut T) };
                (self.setter)(object, V::forward(storage));
                Ok(consumed)
            }
            Err(ConvertFail::Mismatch) => {
                let actual = vm.value_at(-1).map(|v| v.type_name()).unwrap_or("nothing");
                Err(RuntimeError::raise(format!(
                    "cannot assign a {actual} value to this property"
                )))
            }
            Err(ConvertFail::Fault(e)) => Err(e),
        }
    }
}
