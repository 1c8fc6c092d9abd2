//! Deterministic simulation harness
//!
//! [`SimulatedEnvironment`] implements every collaborator over one virtual
//! clock and one ordered event queue, so a test controls exactly when timers
//! fire and when storage and network completions arrive. Storage and network
//! complete by posting to the queue, never inline, matching the hand-off the
//! real runtime performs.

use core::time::Duration;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ClientConfig;
use crate::errors::{Result, StorageError};
use crate::listener::InvalidationListener;
use crate::protocol::wire::{
    ClientToServerMessage, ErrorMessage, InfoRequestMessage, InfoType, ProtocolVersion, Registration,
    RegistrationStatus, RegistrationSummary, ServerHeader, ServerToClientMessage, Status,
    TokenControlMessage, PROTOCOL_VERSION,
};
use crate::protocol::ProtocolHandler;
use crate::recurring_task::TaskName;
use crate::registration::RegistrationManager;
use crate::resources::{
    ClientEvent, EventSink, NetworkChannel, ReadCompletion, Scheduler, Storage, SystemResources,
    WriteCompletion,
};
use crate::session::{ClientBuilder, InvalidationClient};
use crate::types::{
    AckHandle, ApplicationClientId, ClientToken, ErrorInfo, ErrorReason, Invalidation, ObjectId,
    RegistrationOp, RegistrationState, Timestamp,
};

/// Virtual time at which every simulation starts
pub const START_TIME_MS: u64 = 1_000_000;

/// Client type used by [`SimulatedEnvironment::client_builder`]
pub const TEST_CLIENT_TYPE: i32 = 4;

// ----------------------------------------------------------------------------
// Shared Simulation State
// ----------------------------------------------------------------------------

struct SimInner {
    now: u64,
    next_seq: u64,
    /// Events keyed by (due time, insertion order)
    queue: BTreeMap<(u64, u64), ClientEvent>,
    storage: HashMap<String, Vec<u8>>,
    read_failure: Option<StorageError>,
    write_failure: Option<StorageError>,
    sent: Vec<Vec<u8>>,
    network_sink: Option<Arc<dyn EventSink>>,
}

impl SimInner {
    fn enqueue(&mut self, due: u64, event: ClientEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), event);
    }
}

struct SimShared {
    inner: Mutex<SimInner>,
    on_thread: AtomicBool,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for SimShared {
    fn post(&self, event: ClientEvent) {
        let mut inner = self.lock();
        let now = inner.now;
        inner.enqueue(now, event);
    }
}

impl Scheduler for SimShared {
    fn schedule(&self, delay: Duration, task: TaskName) {
        let mut inner = self.lock();
        let due = inner.now + delay.as_millis() as u64;
        inner.enqueue(due, ClientEvent::TaskFired(task));
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.lock().now)
    }

    fn is_running_on_thread(&self) -> bool {
        self.on_thread.load(Ordering::SeqCst)
    }
}

impl Storage for SimShared {
    fn read_key(&self, key: &str, done: ReadCompletion) {
        let result = {
            let inner = self.lock();
            match &inner.read_failure {
                Some(error) => Err(error.clone()),
                None => inner
                    .storage
                    .get(key)
                    .cloned()
                    .ok_or_else(|| StorageError::KeyNotFound { key: key.to_string() }),
            }
        };
        done.complete(result);
    }

    fn write_key(&self, key: &str, value: Vec<u8>, done: WriteCompletion) {
        let result = {
            let mut inner = self.lock();
            match inner.write_failure.clone() {
                Some(error) => Err(error),
                None => {
                    inner.storage.insert(key.to_string(), value);
                    Ok(())
                }
            }
        };
        done.complete(result);
    }
}

impl NetworkChannel for SimShared {
    fn send_message(&self, message: Vec<u8>) {
        self.lock().sent.push(message);
    }

    fn register_listener(&self, sink: Arc<dyn EventSink>) {
        self.lock().network_sink = Some(sink);
    }
}

// ----------------------------------------------------------------------------
// Simulated Environment
// ----------------------------------------------------------------------------

/// Virtual-time implementation of [`SystemResources`]
pub struct SimulatedEnvironment {
    shared: Arc<SimShared>,
    resources: Arc<SystemResources>,
}

impl Default for SimulatedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEnvironment {
    /// Environment at [`START_TIME_MS`] with its resources started
    pub fn new() -> Self {
        let shared = Arc::new(SimShared {
            inner: Mutex::new(SimInner {
                now: START_TIME_MS,
                next_seq: 0,
                queue: BTreeMap::new(),
                storage: HashMap::new(),
                read_failure: None,
                write_failure: None,
                sent: Vec::new(),
                network_sink: None,
            }),
            on_thread: AtomicBool::new(true),
        });
        let resources = Arc::new(SystemResources::new(
            shared.clone(),
            shared.clone(),
            shared.clone(),
            shared.clone(),
        ));
        resources.start();
        Self { shared, resources }
    }

    pub fn resources(&self) -> Arc<SystemResources> {
        Arc::clone(&self.resources)
    }

    /// Builder with the test configuration and a seeded random source
    pub fn client_builder(&self) -> ClientBuilder {
        ClientBuilder::new(
            self.resources(),
            ApplicationClientId::new(TEST_CLIENT_TYPE, b"test-client".to_vec()),
        )
        .with_config(ClientConfig::for_test())
        .with_rng(Box::new(ChaCha8Rng::seed_from_u64(42)))
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::new(self.shared.lock().now)
    }

    /// Make the scheduler report calls as coming from another thread
    pub fn set_on_internal_thread(&self, on_thread: bool) {
        self.shared.on_thread.store(on_thread, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Driving the Client
    // ------------------------------------------------------------------------

    fn pop_due(&self, limit: u64) -> Option<ClientEvent> {
        let mut inner = self.shared.lock();
        let (&(due, seq), _) = inner.queue.iter().next()?;
        if due > limit {
            return None;
        }
        inner.now = inner.now.max(due);
        inner.queue.remove(&(due, seq))
    }

    /// Deliver every event due at the current time, including those the
    /// deliveries themselves post. Returns how many were delivered.
    pub fn run_until_idle<L, P, M>(&self, client: &mut InvalidationClient<L, P, M>) -> Result<usize>
    where
        L: InvalidationListener,
        P: ProtocolHandler,
        M: RegistrationManager,
    {
        let mut delivered = 0;
        loop {
            let now = self.shared.lock().now;
            let Some(event) = self.pop_due(now) else {
                return Ok(delivered);
            };
            client.handle_event(event)?;
            delivered += 1;
        }
    }

    /// Move the clock forward by `by`, delivering events in due order
    pub fn advance<L, P, M>(&self, client: &mut InvalidationClient<L, P, M>, by: Duration) -> Result<usize>
    where
        L: InvalidationListener,
        P: ProtocolHandler,
        M: RegistrationManager,
    {
        let target = self.shared.lock().now + by.as_millis() as u64;
        let mut delivered = 0;
        while let Some(event) = self.pop_due(target) {
            client.handle_event(event)?;
            delivered += 1;
        }
        self.shared.lock().now = target;
        Ok(delivered)
    }

    /// Move the clock without delivering anything
    pub fn advance_clock(&self, by: Duration) {
        self.shared.lock().now += by.as_millis() as u64;
    }

    /// Pending timer firings in due order
    pub fn pending_timers(&self) -> Vec<(Timestamp, TaskName)> {
        self.shared
            .lock()
            .queue
            .iter()
            .filter_map(|(&(due, _), event)| match event {
                ClientEvent::TaskFired(name) => Some((Timestamp::new(due), *name)),
                _ => None,
            })
            .collect()
    }

    /// Due time of the earliest pending firing of `task`
    pub fn next_firing(&self, task: TaskName) -> Option<Timestamp> {
        self.pending_timers()
            .into_iter()
            .find(|(_, name)| *name == task)
            .map(|(due, _)| due)
    }

    // ------------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------------

    fn network_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.shared.lock().network_sink.clone()
    }

    /// Hand `bytes` to the registered network listener; false if none is registered
    pub fn deliver_message(&self, bytes: Vec<u8>) -> bool {
        match self.network_sink() {
            Some(sink) => {
                sink.post(ClientEvent::MessageReceived(bytes));
                true
            }
            None => false,
        }
    }

    pub fn set_online(&self, is_online: bool) {
        if let Some(sink) = self.network_sink() {
            sink.post(ClientEvent::OnlineStatusChanged(is_online));
        }
    }

    pub fn change_address(&self) {
        if let Some(sink) = self.network_sink() {
            sink.post(ClientEvent::AddressChanged);
        }
    }

    /// Every message sent so far, decoded
    pub fn sent_messages(&self) -> Vec<ClientToServerMessage> {
        self.shared
            .lock()
            .sent
            .iter()
            .filter_map(|bytes| ClientToServerMessage::from_binary(bytes).ok())
            .collect()
    }

    /// Decoded messages sent since the last call
    pub fn take_sent_messages(&self) -> Vec<ClientToServerMessage> {
        std::mem::take(&mut self.shared.lock().sent)
            .iter()
            .filter_map(|bytes| ClientToServerMessage::from_binary(bytes).ok())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    pub fn storage_value(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.lock().storage.get(key).cloned()
    }

    pub fn set_storage_value(&self, key: &str, value: Vec<u8>) {
        self.shared.lock().storage.insert(key.to_string(), value);
    }

    /// Make every read fail with `error` until cleared with `None`
    pub fn fail_reads(&self, error: Option<StorageError>) {
        self.shared.lock().read_failure = error;
    }

    /// Make every write fail with `error` until cleared with `None`
    pub fn fail_writes(&self, error: Option<StorageError>) {
        self.shared.lock().write_failure = error;
    }
}

// ----------------------------------------------------------------------------
// Recording Listener
// ----------------------------------------------------------------------------

/// One listener callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerCall {
    Ready,
    Invalidate(Invalidation, AckHandle),
    InvalidateUnknownVersion(ObjectId, AckHandle),
    InvalidateAll(AckHandle),
    RegistrationStatus(ObjectId, RegistrationState),
    RegistrationFailure {
        object_id: ObjectId,
        is_transient: bool,
        message: String,
    },
    ReissueRegistrations(Vec<u8>, u32),
    Error(ErrorInfo),
}

/// Listener that records every callback in order
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub calls: Vec<ListenerCall>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<ListenerCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn ready_count(&self) -> usize {
        self.calls.iter().filter(|call| **call == ListenerCall::Ready).count()
    }

    /// Ack handles of every invalidation-type callback, in order
    pub fn ack_handles(&self) -> Vec<AckHandle> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                ListenerCall::Invalidate(_, handle)
                | ListenerCall::InvalidateUnknownVersion(_, handle)
                | ListenerCall::InvalidateAll(handle) => Some(handle.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn registration_failures(&self) -> Vec<(ObjectId, bool, String)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                ListenerCall::RegistrationFailure {
                    object_id,
                    is_transient,
                    message,
                } => Some((object_id.clone(), *is_transient, message.clone())),
                _ => None,
            })
            .collect()
    }
}

impl InvalidationListener for RecordingListener {
    fn ready(&mut self) {
        self.calls.push(ListenerCall::Ready);
    }

    fn invalidate(&mut self, invalidation: &Invalidation, ack_handle: AckHandle) {
        self.calls
            .push(ListenerCall::Invalidate(invalidation.clone(), ack_handle));
    }

    fn invalidate_unknown_version(&mut self, object_id: &ObjectId, ack_handle: AckHandle) {
        self.calls
            .push(ListenerCall::InvalidateUnknownVersion(object_id.clone(), ack_handle));
    }

    fn invalidate_all(&mut self, ack_handle: AckHandle) {
        self.calls.push(ListenerCall::InvalidateAll(ack_handle));
    }

    fn inform_registration_status(&mut self, object_id: &ObjectId, state: RegistrationState) {
        self.calls
            .push(ListenerCall::RegistrationStatus(object_id.clone(), state));
    }

    fn inform_registration_failure(&mut self, object_id: &ObjectId, is_transient: bool, message: &str) {
        self.calls.push(ListenerCall::RegistrationFailure {
            object_id: object_id.clone(),
            is_transient,
            message: message.to_string(),
        });
    }

    fn reissue_registrations(&mut self, prefix: &[u8], prefix_len: u32) {
        self.calls
            .push(ListenerCall::ReissueRegistrations(prefix.to_vec(), prefix_len));
    }

    fn inform_error(&mut self, error: &ErrorInfo) {
        self.calls.push(ListenerCall::Error(error.clone()));
    }
}

// ----------------------------------------------------------------------------
// Server Message Builder
// ----------------------------------------------------------------------------

/// Builds server-to-client messages for tests
#[derive(Debug, Clone)]
pub struct ServerMessageBuilder {
    message: ServerToClientMessage,
}

impl ServerMessageBuilder {
    /// Message addressed to `token` (a token or a pending nonce)
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            message: ServerToClientMessage {
                header: ServerHeader {
                    protocol_version: PROTOCOL_VERSION,
                    client_token: token.into(),
                    registration_summary: None,
                    server_time_ms: 0,
                    message_id: None,
                },
                token_control: None,
                invalidations: None,
                registration_statuses: None,
                registration_sync_request: false,
                info_request: None,
                error: None,
            },
        }
    }

    pub fn protocol_major(mut self, major: u32) -> Self {
        self.message.header.protocol_version = ProtocolVersion {
            major,
            minor: PROTOCOL_VERSION.minor,
        };
        self
    }

    pub fn server_time(mut self, server_time_ms: u64) -> Self {
        self.message.header.server_time_ms = server_time_ms;
        self
    }

    pub fn summary(mut self, summary: RegistrationSummary) -> Self {
        self.message.header.registration_summary = Some(summary);
        self
    }

    pub fn new_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.message.token_control = Some(TokenControlMessage {
            new_token: Some(ClientToken::new(token)),
        });
        self
    }

    pub fn destroy_token(mut self) -> Self {
        self.message.token_control = Some(TokenControlMessage { new_token: None });
        self
    }

    pub fn invalidation(mut self, invalidation: Invalidation) -> Self {
        self.message
            .invalidations
            .get_or_insert_with(Vec::new)
            .push(invalidation);
        self
    }

    pub fn registration_status(mut self, object_id: ObjectId, op: RegistrationOp, status: Status) -> Self {
        self.message
            .registration_statuses
            .get_or_insert_with(Vec::new)
            .push(RegistrationStatus {
                registration: Registration { object_id, op },
                status,
            });
        self
    }

    pub fn sync_request(mut self) -> Self {
        self.message.registration_sync_request = true;
        self
    }

    pub fn info_request(mut self, info_types: Vec<InfoType>) -> Self {
        self.message.info_request = Some(InfoRequestMessage { info_types });
        self
    }

    pub fn error(mut self, code: ErrorReason, description: impl Into<String>) -> Self {
        self.message.error = Some(ErrorMessage {
            code,
            description: description.into(),
        });
        self
    }

    pub fn build(self) -> ServerToClientMessage {
        self.message
    }

    /// Encoded message; encoding an in-memory message cannot fail
    pub fn encode(self) -> Vec<u8> {
        bincode::serialize(&self.message).unwrap_or_default()
    }
}
