//! Deterministic hash-based type identity.
//!
//! A [`TypeHash`] is a 64-bit hash computed from a registered class's display
//! name. It is stamped into every opaque block handed to the boundary and
//! checked again on every pointer conversion, so a block produced for one
//! class can never be reinterpreted as another even across independent
//! runtime instances.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

/// Domain-separation seeds so names of different entity kinds cannot collide.
mod seeds {
    /// Seed for bound class names.
    pub const CLASS: u64 = 0x2fac10b63a6cc57c;
    /// Seed for boundary-visible function names.
    pub const FUNCTION: u64 = 0x5ea77ffbcdf5f302;
}

/// 64-bit identity for a registered name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHash(u64);

impl TypeHash {
    /// Hash of a bound class's display name.
    pub fn from_class_name(name: &str) -> TypeHash {
        TypeHash(xxh64(name.as_bytes(), seeds::CLASS))
    }

    /// Hash of a boundary-visible function name.
    pub fn from_function_name(name: &str) -> TypeHash {
        TypeHash(xxh64(name.as_bytes(), seeds::FUNCTION))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash({:#018x})", self.0)
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(
            TypeHash::from_class_name("Storage"),
            TypeHash::from_class_name("Storage")
        );
    }

    #[test]
    fn distinct_names_distinct_hashes() {
        assert_ne!(
            TypeHash::from_class_name("Storage"),
            TypeHash::from_class_name("Widget")
        );
    }

    #[test]
    fn domains_are_separated() {
        assert_ne!(
            TypeHash::from_class_name("add"),
            TypeHash::from_function_name("add")
        );
    }
}
