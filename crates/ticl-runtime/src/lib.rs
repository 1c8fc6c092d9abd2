//! Invalidation Client Runtime
//!
//! Runs one [`ticl_core::InvalidationClient`] on a dedicated thread:
//! - `TokioScheduler`, `MemoryStorage`, `FileStorage` and `ChannelNetwork`
//!   implement the core's collaborator traits over tokio
//! - `ClientTask` is the single owner of the client and serializes
//!   application commands with timer, storage and network events
//! - `RuntimeBuilder` / `RuntimeHandle` give the application an async API
//!   and the stream of listener callbacks as [`AppEvent`]s

pub mod builder;
pub mod error;
pub mod listener;
pub mod resources;
pub mod task;

pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use error::{RuntimeError, RuntimeResult};
pub use listener::{AppEvent, ChannelListener};
pub use resources::{
    channel_network, ChannelEventSink, ChannelNetwork, FileStorage, MemoryStorage, NetworkHandle,
    TokioScheduler,
};
pub use task::{ClientSnapshot, ClientTask, Command};

// Re-export core types for convenience
pub use ticl_core::{
    AckHandle, ApplicationClientId, ClientConfig, ClientState, ErrorInfo, ErrorReason, Invalidation,
    ObjectId, RegistrationState, RunState, TiclError,
};
