//! Runtime error type.
//!
//! Native closures signal failure by returning one of these; [`crate::Vm::pcall`]
//! catches them, restores the stack, and hands them back to the caller. Raising
//! an error from boundary-visible code is just `Err(RuntimeError::raise(..))`.

use thiserror::Error;

/// Errors produced while driving the boundary runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// A host-visible error raised by boundary-visible code.
    #[error("{0}")]
    Raised(String),

    /// A stack index referred outside the current frame.
    #[error("stack index {index} out of range (frame height {height})")]
    BadIndex { index: i32, height: usize },

    /// Attempted to call a value with no call handler.
    #[error("attempt to call a {kind} value")]
    NotCallable { kind: &'static str },

    /// Attempted to index a value that supports no field access.
    #[error("attempt to index a {kind} value")]
    NotIndexable { kind: &'static str },

    /// A value of this kind cannot be used as a table key.
    #[error("a {kind} value cannot be used as a table key")]
    InvalidKey { kind: &'static str },

    /// A registry key outlived the slot it referred to.
    #[error("stale registry reference")]
    StaleRegistryKey,
}

impl RuntimeError {
    /// Raise a host-visible error with the given message.
    pub fn raise(message: impl Into<String>) -> Self {
        RuntimeError::Raised(message.into())
    }
}
