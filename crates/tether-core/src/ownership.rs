//! Ownership tagging for class pointers crossing the boundary.
//!
//! Every class instance handed to the boundary travels inside a
//! [`TaggedBlock`]: the native pointer, a tag byte whose low bits carry the
//! [`Ownership`] state, and the class's [`TypeHash`]. The pointer itself is
//! stored clean (the tag lives in its own byte, not in the pointer's low
//! bits) so conversion logic never dereferences a dirty address. Finalizers
//! must consult the tag before deleting: Owned blocks are deleted exactly
//! once at collection time, Unowned blocks never.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::type_hash::TypeHash;

/// Mask selecting the ownership bits of the tag byte.
pub const OWNERSHIP_MASK: u8 = 0x03;

/// Who is responsible for deleting the native object behind a block.
///
/// Pointers surfaced through field accessors or raw-pointer pushes are
/// `Unowned`: the native side keeps the object alive. Pointers produced by
/// a registered constructor or a by-value return are `Owned`: the
/// boundary's finalizer deletes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Ownership {
    Unowned = 0,
    Owned = 1,
}

/// The opaque payload stored in a boundary userdata for a bound class.
#[derive(Clone, Copy)]
pub struct TaggedBlock {
    ptr: *mut (),
    bits: u8,
    type_hash: TypeHash,
}

impl TaggedBlock {
    pub fn new(ptr: *mut (), ownership: Ownership, type_hash: TypeHash) -> TaggedBlock {
        TaggedBlock {
            ptr,
            bits: u8::from(ownership) & OWNERSHIP_MASK,
            type_hash,
        }
    }

    /// The native pointer, already clean of tag bits.
    pub fn pointer(&self) -> *mut () {
        self.ptr
    }

    pub fn ownership(&self) -> Ownership {
        Ownership::try_from(self.bits & OWNERSHIP_MASK).unwrap_or(Ownership::Unowned)
    }

    /// Mark the block released so a finalizer cannot double-delete.
    pub fn disown(&mut self) {
        self.bits = u8::from(Ownership::Unowned);
    }

    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }
}

impl std::fmt::Debug for TaggedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedBlock")
            .field("ptr", &self.ptr)
            .field("ownership", &self.ownership())
            .field("type_hash", &self.type_hash)
            .finish()
    }
}
