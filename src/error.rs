//! The facade's public error type.
//!
//! `EngineError` is the only error type callers of the public API (§6.1) ever
//! see. Every component has its own richer `thiserror` enum; this type
//! collapses them into the four-way taxonomy the facade promises:
//! `NotStarted`, `Validation`, `StoreUnavailable`, `NotFound`. Conversions are
//! `#[from]` where the mapping is lossless and explicit functions where it
//! isn't (§7).

use thiserror::Error;

use crate::registry::RegistryError;
use crate::store::StoreError;

/// The error type returned by every facade method.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A method was called before `Engine::start` completed, or after
    /// `Engine::stop`.
    #[error("engine has not been started")]
    NotStarted,

    /// A caller-supplied value failed validation.
    #[error("validation failed: {reason}")]
    Validation {
        /// Why the value was rejected.
        reason: String,
    },

    /// The persistence layer rejected or could not complete an operation.
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// The requested record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// A human-readable description of what was missing.
        what: String,
    },
}

impl From<StoreError> for EngineError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::NotFound { what } => Self::NotFound { what },
            other => Self::StoreUnavailable { source: other },
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::AgentNotFound { agent_id } => Self::NotFound {
                what: format!("agent {agent_id}"),
            },
            RegistryError::AgentAlreadyRegistered { agent_id } => Self::Validation {
                reason: format!("agent {agent_id} is already registered"),
            },
            RegistryError::InvalidRegistration { reason } => Self::Validation { reason },
        }
    }
}
