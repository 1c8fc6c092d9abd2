//! Collaborator contracts consumed by the client
//!
//! The client owns no threads and performs no I/O itself. Everything that
//! crosses a thread boundary (timers, storage completions, inbound network
//! traffic) comes back to the client as a [`ClientEvent`] posted through an
//! [`EventSink`], and the embedding runtime feeds those events to
//! [`crate::InvalidationClient::handle_event`] on the internal thread.

use core::fmt;
use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::errors::StorageError;
use crate::recurring_task::TaskName;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Internal Events
// ----------------------------------------------------------------------------

/// Work item delivered to the client on its internal thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A delay requested through [`Scheduler::schedule`] elapsed
    TaskFired(TaskName),
    /// Raw bytes received from the server
    MessageReceived(Vec<u8>),
    OnlineStatusChanged(bool),
    /// The network address of this device changed
    AddressChanged,
    /// Completion of the startup read of the persisted token blob
    PersistentStateRead(Result<Vec<u8>, StorageError>),
    /// Completion of a write of the persisted token blob
    PersistentStateWritten(Result<(), StorageError>),
}

/// Hand-off point onto the internal thread
pub trait EventSink: Send + Sync {
    fn post(&self, event: ClientEvent);
}

/// Callback handle for one asynchronous storage operation
///
/// Storage implementations call [`Completion::complete`] exactly once, from
/// any thread; the result reaches the client as a [`ClientEvent`].
pub struct Completion<T> {
    sink: Arc<dyn EventSink>,
    wrap: fn(Result<T, StorageError>) -> ClientEvent,
}

pub type ReadCompletion = Completion<Vec<u8>>;
pub type WriteCompletion = Completion<()>;

impl<T> Completion<T> {
    pub fn new(sink: Arc<dyn EventSink>, wrap: fn(Result<T, StorageError>) -> ClientEvent) -> Self {
        Self { sink, wrap }
    }

    pub fn complete(self, result: Result<T, StorageError>) {
        self.sink.post((self.wrap)(result));
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Timer service bound to the client's internal thread
pub trait Scheduler: Send + Sync {
    /// Post [`ClientEvent::TaskFired`] for `task` once `delay` has elapsed.
    /// Must not block and must not run the task inline.
    fn schedule(&self, delay: Duration, task: TaskName);

    fn now(&self) -> Timestamp;

    /// Whether the caller is executing on the internal thread
    fn is_running_on_thread(&self) -> bool;
}

/// Asynchronous key-value store for the persisted token blob
pub trait Storage: Send + Sync {
    fn read_key(&self, key: &str, done: ReadCompletion);
    fn write_key(&self, key: &str, value: Vec<u8>, done: WriteCompletion);
}

/// Message transport to the invalidation server
pub trait NetworkChannel: Send + Sync {
    fn send_message(&self, message: Vec<u8>);

    /// Inbound messages, online status and address changes are posted to
    /// `sink` as [`ClientEvent`]s
    fn register_listener(&self, sink: Arc<dyn EventSink>);
}

// ----------------------------------------------------------------------------
// Resource Bundle
// ----------------------------------------------------------------------------

/// The collaborators shared by every part of the client
///
/// The lifecycle is controlled by the embedding application; a client may
/// only be started once its resources are.
pub struct SystemResources {
    scheduler: Arc<dyn Scheduler>,
    storage: Arc<dyn Storage>,
    network: Arc<dyn NetworkChannel>,
    event_sink: Arc<dyn EventSink>,
    started: AtomicBool,
}

impl SystemResources {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        storage: Arc<dyn Storage>,
        network: Arc<dyn NetworkChannel>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scheduler,
            storage,
            network,
            event_sink,
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("System resources started");
        }
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            info!("System resources stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn network(&self) -> &Arc<dyn NetworkChannel> {
        &self.network
    }

    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }
}

impl fmt::Debug for SystemResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemResources")
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
