//! Error types for conversion and registration.

use thiserror::Error;

use tether_runtime::RuntimeError;

/// Errors produced while converting values across the boundary.
///
/// Note that these are *hard* failures. The soft, overload-driving failure
/// is [`crate::ConvertFail::Mismatch`] and never surfaces as an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    /// A value's dynamic type was incompatible with the requested native type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// An integral value did not fit the native target type.
    /// Raised only under `VmOptions::CHECK_INTEGER_OVERFLOW`.
    #[error("integer overflow: {value} does not fit in {target}")]
    IntegerOverflow { value: i64, target: &'static str },

    /// A handle could not be cast to the requested native type.
    #[error("bad cast to {target}")]
    BadCast { target: &'static str },

    /// A runtime error surfaced during conversion.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<ConversionError> for RuntimeError {
    fn from(err: ConversionError) -> RuntimeError {
        match err {
            ConversionError::Runtime(e) => e,
            other => RuntimeError::raise(other.to_string()),
        }
    }
}

/// Errors produced while building bindings.
///
/// These surface at registration time, out of the fluent registration chain,
/// never at call time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    /// `open` was called on a runtime that is already open.
    #[error("binding layer is already open for this runtime")]
    AlreadyOpen,

    /// The binding layer has not been opened for this runtime.
    #[error("binding layer is not open for this runtime")]
    NotOpen,

    /// A namespace name collides with an existing non-table value.
    #[error("scope '{name}' collides with a {found} value in the containing scope")]
    ScopeCollision { name: String, found: &'static str },

    /// A table under the namespace name is not the namespace it claims.
    #[error("scope '{name}' exists but names the namespace '{found}'")]
    ScopeMismatch { name: String, found: String },

    /// `endscope` was called on the root scope.
    #[error("endscope called on the root scope")]
    EndOfRootScope,

    /// `end` was called on a nested scope.
    #[error("end called on open scope '{name}'")]
    UnclosedScope { name: String },

    /// The class (by native type or boundary name) is already registered
    /// with this runtime instance.
    #[error("class '{name}' is already registered")]
    ClassAlreadyRegistered { name: String },

    /// `constant` only accepts primitive values.
    #[error("constant '{name}' must be a primitive value")]
    NonPrimitiveConstant { name: String },

    /// A runtime error surfaced during registration.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_error_messages() {
        let err = ConversionError::TypeMismatch {
            expected: "int",
            actual: "string",
        };
        assert_eq!(err.to_string(), "type mismatch: expected int, got string");

        let err = ConversionError::IntegerOverflow {
            value: 270,
            target: "u8",
        };
        assert!(err.to_string().contains("270"));
    }

    #[test]
    fn conversion_error_raises_as_runtime_error() {
        let err: RuntimeError = ConversionError::BadCast { target: "i64" }.into();
        assert_eq!(err, RuntimeError::raise("bad cast to i64"));
    }

    #[test]
    fn runtime_error_passes_through() {
        let original = RuntimeError::raise("boom");
        let wrapped = ConversionError::Runtime(original.clone());
        let back: RuntimeError = wrapped.into();
        assert_eq!(back, original);
    }
}
