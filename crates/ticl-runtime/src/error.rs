//! Runtime error types

use thiserror::Error;
use ticl_core::TiclError;

/// Errors surfaced by the runtime and its handle
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Client error: {0}")]
    Client(#[from] TiclError),

    /// The client hit a fatal error and its task has stopped
    #[error("Client task stopped after fatal error: {reason}")]
    Fatal { reason: String },

    #[error("Client task is not running")]
    ChannelClosed,

    #[error("Failed to start client task: {reason}")]
    Startup { reason: String },

    #[error("Client task panicked: {reason}")]
    TaskPanicked { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn startup<T: Into<String>>(reason: T) -> Self {
        Self::Startup {
            reason: reason.into(),
        }
    }
}

pub type RuntimeResult<T> = core::result::Result<T, RuntimeError>;
