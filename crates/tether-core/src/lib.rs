//! Marshalling core for the tether binding layer.
//!
//! This crate owns everything between a native Rust signature and the
//! boundary stack: the per-type conversion traits, the ownership-tagged
//! opaque blocks that carry class pointers across the boundary, the call
//! marshalling engine, overload resolution, and the member descriptors the
//! class trampolines route through. The fluent registration DSL and the
//! handle types live in the `tether` facade crate on top of this one.

mod class_info;
mod convert;
mod error;
mod marshal;
mod members;
mod overload;
mod ownership;
mod stack_guard;
mod statistics;
mod type_hash;

pub use class_info::{BinderState, ClassRegistry, ClassRepresentation, binder_state};
pub use convert::{
    ConvertFail, FromStack, Ignored, Pulled, Scripted, ToStack, pull_class_pointer,
    push_class_pointer, push_class_value,
};
pub use error::{BindError, ConversionError};
pub use marshal::{
    BoundConstructor, BoundFunction, BoundMethod, ByMut, ByRef, CallPolicy, MarshalledFn,
};
pub use members::{
    FieldGet, FieldSet, Member, MemberSlot, ReadOnlyField, ReadOnlyProperty, ReadWriteField,
    ReadWriteProperty,
};
pub use overload::{FunctionEntry, FunctionSlot, install_function};
pub use ownership::{OWNERSHIP_MASK, Ownership, TaggedBlock};
pub use stack_guard::StackGuard;
pub use statistics::{Statistics, StatisticsSnapshot};
pub use type_hash::TypeHash;
