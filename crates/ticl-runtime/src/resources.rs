//! Tokio implementations of the client's collaborators

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ticl_core::resources::{ReadCompletion, WriteCompletion};
use ticl_core::{ClientEvent, EventSink, NetworkChannel, Scheduler, Storage, StorageError, TaskName};
use ticl_core::types::Timestamp;

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// Forwards client events into the client task's event channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn post(&self, event: ClientEvent) {
        if self.sender.send(event).is_err() {
            debug!("Client task gone; dropping event");
        }
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Timers on the client thread's tokio runtime
///
/// Must be created on the thread that runs the client; that thread is the
/// one [`Scheduler::is_running_on_thread`] accepts.
pub struct TokioScheduler {
    handle: Handle,
    sink: Arc<dyn EventSink>,
    thread_id: ThreadId,
}

impl TokioScheduler {
    pub fn new(handle: Handle, sink: Arc<dyn EventSink>) -> Self {
        Self {
            handle,
            sink,
            thread_id: std::thread::current().id(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TaskName) {
        let sink = Arc::clone(&self.sink);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            sink.post(ClientEvent::TaskFired(task));
        });
    }

    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn is_running_on_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

/// In-memory key/value storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }
}

impl Storage for MemoryStorage {
    fn read_key(&self, key: &str, done: ReadCompletion) {
        let result = self
            .get(key)
            .ok_or_else(|| StorageError::KeyNotFound { key: key.to_string() });
        done.complete(result);
    }

    fn write_key(&self, key: &str, value: Vec<u8>, done: WriteCompletion) {
        self.insert(key, value);
        done.complete(Ok(()));
    }
}

/// One file per key under a directory, accessed with `tokio::fs`
///
/// Calls must come from inside a tokio runtime; outside one they complete
/// with [`StorageError::Unavailable`].
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::Io {
                reason: format!("invalid storage key {:?}", key),
            });
        }
        Ok(self.root.join(key))
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Io {
        reason: e.to_string(),
    }
}

impl Storage for FileStorage {
    fn read_key(&self, key: &str, done: ReadCompletion) {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(e) => return done.complete(Err(e)),
        };
        let Ok(handle) = Handle::try_current() else {
            warn!("File storage used outside a tokio runtime");
            return done.complete(Err(StorageError::Unavailable));
        };
        let key = key.to_string();
        handle.spawn(async move {
            let result = match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::KeyNotFound { key })
                }
                Err(e) => Err(io_error(e)),
            };
            done.complete(result);
        });
    }

    fn write_key(&self, key: &str, value: Vec<u8>, done: WriteCompletion) {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(e) => return done.complete(Err(e)),
        };
        let Ok(handle) = Handle::try_current() else {
            warn!("File storage used outside a tokio runtime");
            return done.complete(Err(StorageError::Unavailable));
        };
        let root = self.root.clone();
        handle.spawn(async move {
            // Write then rename so a crash never leaves a torn value behind
            let staging = path.with_extension("tmp");
            let result = async {
                tokio::fs::create_dir_all(&root).await?;
                tokio::fs::write(&staging, &value).await?;
                tokio::fs::rename(&staging, &path).await
            }
            .await
            .map_err(io_error);
            done.complete(result);
        });
    }
}

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

#[derive(Default)]
struct NetworkShared {
    listener: OnceLock<Arc<dyn EventSink>>,
}

/// Network channel whose outbound messages go to an mpsc receiver and whose
/// inbound side is driven through a [`NetworkHandle`]
pub struct ChannelNetwork {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<NetworkShared>,
}

/// Create a channel network, the handle that feeds it, and the receiver of
/// every message the client sends
pub fn channel_network() -> (ChannelNetwork, NetworkHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (outbound, outbound_receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(NetworkShared::default());
    let network = ChannelNetwork {
        outbound,
        shared: Arc::clone(&shared),
    };
    (network, NetworkHandle { shared }, outbound_receiver)
}

impl NetworkChannel for ChannelNetwork {
    fn send_message(&self, message: Vec<u8>) {
        if self.outbound.send(message).is_err() {
            warn!("Outbound channel closed; dropping message");
        }
    }

    fn register_listener(&self, sink: Arc<dyn EventSink>) {
        if self.shared.listener.set(sink).is_err() {
            warn!("Network listener already registered; keeping the first");
        }
    }
}

/// Inbound side of a [`ChannelNetwork`]
///
/// Every method returns false while no client listener is registered.
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<NetworkShared>,
}

impl NetworkHandle {
    fn post(&self, event: ClientEvent) -> bool {
        match self.shared.listener.get() {
            Some(sink) => {
                sink.post(event);
                true
            }
            None => false,
        }
    }

    pub fn deliver(&self, message: Vec<u8>) -> bool {
        self.post(ClientEvent::MessageReceived(message))
    }

    pub fn set_online(&self, is_online: bool) -> bool {
        self.post(ClientEvent::OnlineStatusChanged(is_online))
    }

    pub fn address_changed(&self) -> bool {
        self.post(ClientEvent::AddressChanged)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ticl_core::resources::Completion;

    fn sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelEventSink::new(sender)), receiver)
    }

    #[test]
    fn test_memory_storage_round_trip() {
        let (sink, mut events) = sink();
        let storage = MemoryStorage::new();

        storage.read_key("ClientToken", Completion::new(sink.clone(), ClientEvent::PersistentStateRead));
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::PersistentStateRead(Err(StorageError::KeyNotFound {
                key: "ClientToken".into()
            }))
        );

        storage.write_key(
            "ClientToken",
            b"state".to_vec(),
            Completion::new(sink.clone(), ClientEvent::PersistentStateWritten),
        );
        assert_eq!(events.try_recv().unwrap(), ClientEvent::PersistentStateWritten(Ok(())));

        storage.read_key("ClientToken", Completion::new(sink, ClientEvent::PersistentStateRead));
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::PersistentStateRead(Ok(b"state".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut events) = sink();
        let storage = FileStorage::new(dir.path().join("state"));

        storage.read_key("ClientToken", Completion::new(sink.clone(), ClientEvent::PersistentStateRead));
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::PersistentStateRead(Err(StorageError::KeyNotFound { .. }))
        ));

        storage.write_key(
            "ClientToken",
            b"state".to_vec(),
            Completion::new(sink.clone(), ClientEvent::PersistentStateWritten),
        );
        assert_eq!(events.recv().await.unwrap(), ClientEvent::PersistentStateWritten(Ok(())));

        storage.read_key("ClientToken", Completion::new(sink, ClientEvent::PersistentStateRead));
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::PersistentStateRead(Ok(b"state".to_vec()))
        );
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let (sink, mut events) = sink();
        let storage = FileStorage::new("/tmp/unused");

        storage.read_key("../escape", Completion::new(sink, ClientEvent::PersistentStateRead));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::PersistentStateRead(Err(StorageError::Io { .. }))
        ));
    }

    #[test]
    fn test_network_handle_needs_listener() {
        let (network, handle, mut outbound) = channel_network();
        assert!(!handle.deliver(b"early".to_vec()));

        let (sink, mut events) = sink();
        network.register_listener(sink);
        assert!(handle.deliver(b"hello".to_vec()));
        assert!(handle.set_online(false));
        assert_eq!(events.try_recv().unwrap(), ClientEvent::MessageReceived(b"hello".to_vec()));
        assert_eq!(events.try_recv().unwrap(), ClientEvent::OnlineStatusChanged(false));

        network.send_message(b"out".to_vec());
        assert_eq!(outbound.try_recv().unwrap(), b"out".to_vec());
    }

    #[tokio::test]
    async fn test_scheduler_fires_on_runtime() {
        let (sink, mut events) = sink();
        let scheduler = TokioScheduler::new(Handle::current(), sink);
        assert!(scheduler.is_running_on_thread());

        scheduler.schedule(Duration::from_millis(5), TaskName::Heartbeat);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::TaskFired(TaskName::Heartbeat));
    }
}
