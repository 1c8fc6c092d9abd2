//! Error types for the invalidation client
//!
//! The client distinguishes four classes of failure:
//! - fatal precondition violations (wrong thread, token/nonce exclusivity,
//!   mismatched token-control nonce) which are returned as
//!   [`TiclError::Precondition`] before any state is touched
//! - recoverable protocol faults, which are only counted and logged
//! - transient storage faults, retried by the owning recurring task
//! - server-reported errors, surfaced through the application listener
//!
//! Only the first class and caller-contract errors ever reach a `Result`.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures of the persistent storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },
    #[error("Storage I/O error: {reason}")]
    Io { reason: String },
    #[error("Storage is unavailable")]
    Unavailable,
}

/// Failures decoding a persisted state blob
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Persisted state blob is corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("Persisted state authentication code does not match its contents")]
    DigestMismatch,
}

// ----------------------------------------------------------------------------
// Client Error
// ----------------------------------------------------------------------------

/// Core error type for the invalidation client
#[derive(Debug, Error)]
pub enum TiclError {
    /// A caller or collaborator broke a contract the client relies on.
    /// The operation was aborted; the embedding runtime must treat this as fatal.
    #[error("Precondition violated: {reason}")]
    Precondition { reason: String },

    #[error("Client has not been started; wait for the ready callback")]
    NotStarted,

    #[error("Client has already been started")]
    AlreadyStarted,

    #[error("System resources must be started before the client")]
    ResourcesNotStarted,

    #[error("At least one object id must be specified")]
    EmptyObjectSet,

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TiclError {
    /// Create a precondition violation with a reason
    pub fn precondition<T: Into<String>>(reason: T) -> Self {
        TiclError::Precondition {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TiclError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether the error indicates a broken contract the client cannot recover from
    pub fn is_fatal(&self) -> bool {
        matches!(self, TiclError::Precondition { .. })
    }
}

/// Return a [`TiclError::Precondition`] unless `cond` holds.
macro_rules! check_state {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::errors::TiclError::precondition(format!($($arg)+)));
        }
    };
}

pub(crate) use check_state;

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, TiclError>;
pub type TiclResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded(value: u32) -> Result<u32> {
        check_state!(value > 3, "value {} too small", value);
        Ok(value)
    }

    #[test]
    fn test_check_state_macro() {
        assert_eq!(guarded(5).unwrap(), 5);
        let err = guarded(1).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Precondition violated: value 1 too small");
    }

    #[test]
    fn test_only_precondition_is_fatal() {
        assert!(!TiclError::NotStarted.is_fatal());
        assert!(!TiclError::config_error("bad").is_fatal());
        assert!(!TiclError::from(StorageError::Unavailable).is_fatal());
    }
}
