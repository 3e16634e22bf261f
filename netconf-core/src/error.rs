//! Core error types.

use thiserror::Error;

/// Errors from the capability registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("invalid capability id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("cyclic capability dependency involving '{id}'")]
    CyclicDependency { id: String },

    #[error("unknown capability: {id}")]
    Unknown { id: String },
}

impl CapabilityError {
    pub(crate) fn invalid(id: &str, reason: impl Into<String>) -> Self {
        CapabilityError::InvalidId {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Configuration errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CapabilityError::CyclicDependency { .. })
    }
}
