//! Client side of a server-driven object invalidation protocol
//!
//! An application registers interest in objects; the server pushes
//! invalidations for them. This crate holds the session state machine
//! ([`InvalidationClient`]) together with its recurring tasks, backoff,
//! persistence, registration bookkeeping and statistics. It performs no I/O
//! of its own: the embedding runtime supplies a scheduler, storage and a
//! network channel through [`SystemResources`] and feeds their completions
//! back as [`ClientEvent`]s.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod backoff;
pub mod config;
pub mod errors;
pub mod listener;
pub mod persistence;
pub mod protocol;
pub mod recurring_task;
pub mod registration;
pub mod resources;
pub mod session;
pub mod smearer;
pub mod statistics;
pub mod tasks;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ClientConfig, ProtocolHandlerConfig};
pub use errors::{PersistenceError, Result, StorageError, TiclError, TiclResult};
pub use listener::InvalidationListener;
pub use recurring_task::TaskName;
pub use resources::{ClientEvent, EventSink, NetworkChannel, Scheduler, Storage, SystemResources};
pub use session::{ClientBuilder, ClientState, InvalidationClient};
pub use statistics::Statistics;
pub use types::{
    AckHandle, ApplicationClientId, ClientToken, ErrorInfo, ErrorReason, Invalidation, Nonce, ObjectId,
    RegistrationOp, RegistrationState, RunState, Timestamp,
};
