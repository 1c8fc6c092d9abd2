//! Client session state machine
//!
//! [`InvalidationClient`] owns the whole session: token and nonce, run
//! state, the recurring tasks, the protocol handler and the registration
//! manager. It is driven from a single internal thread, either by
//! application calls ([`InvalidationClient::start`],
//! [`InvalidationClient::register`], ...) or by [`ClientEvent`]s the
//! collaborators post back through the resource bundle's event sink.
//!
//! Every entry point first checks it runs on the internal thread. Broken
//! contracts are returned as [`crate::TiclError::Precondition`] before any state
//! is touched; the embedding runtime must treat them as fatal.

mod handlers;
mod operations;
mod policies;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::errors::{check_state, Result};
use crate::listener::InvalidationListener;
use crate::persistence::PersistentTiclState;
use crate::protocol::{BatchingProtocolHandler, ProtocolHandler, ProtocolHandlerState};
use crate::recurring_task::TaskName;
use crate::registration::{DigestRegistrationManager, RegistrationManager, RegistrationManagerState};
use crate::resources::{ClientEvent, SystemResources};
use crate::smearer::Smearer;
use crate::statistics::{ListenerEventType, Statistics, StatisticsState};
use crate::tasks::{BatchingTrigger, TaskSet, TaskStates};
use crate::types::{ApplicationClientId, ClientToken, Nonce, RunState, Timestamp};

// ----------------------------------------------------------------------------
// Marshalled State
// ----------------------------------------------------------------------------

/// Complete marshalled session, sufficient to resume a client in another process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub client_token: Option<ClientToken>,
    pub nonce: Option<Nonce>,
    pub last_message_send_time_ms: u64,
    pub should_send_registrations: bool,
    pub is_online: bool,
    pub run_state: RunState,
    pub registration_manager: RegistrationManagerState,
    pub protocol_handler: ProtocolHandlerState,
    pub statistics: StatisticsState,
    pub tasks: TaskStates,
    pub last_written_state: Option<PersistentTiclState>,
    pub next_perf_send_time_ms: u64,
}

impl ClientState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`InvalidationClient`]
pub struct ClientBuilder {
    resources: Arc<SystemResources>,
    client_id: ApplicationClientId,
    config: ClientConfig,
    rng: Option<Box<dyn RngCore + Send>>,
    saved_state: Option<ClientState>,
}

impl ClientBuilder {
    pub fn new(resources: Arc<SystemResources>, client_id: ApplicationClientId) -> Self {
        Self {
            resources,
            client_id,
            config: ClientConfig::default(),
            rng: None,
            saved_state: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Random source for delay smearing; defaults to the OS generator
    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Resume from a state produced by [`InvalidationClient::marshal`]
    pub fn with_state(mut self, state: ClientState) -> Self {
        self.saved_state = Some(state);
        self
    }

    /// Build a client with the default protocol handler and registration manager
    pub fn build<L: InvalidationListener>(self, listener: L) -> Result<InvalidationClient<L>> {
        let saved = self.saved_state.as_ref();
        let protocol = BatchingProtocolHandler::new(
            self.config.protocol_handler.clone(),
            saved.map(|state| state.protocol_handler.clone()),
        );
        let registrations =
            DigestRegistrationManager::new(saved.map(|state| state.registration_manager.clone()));
        self.build_with(listener, protocol, registrations)
    }

    /// Build a client around caller-supplied collaborators. When resuming,
    /// `protocol` and `registrations` must already carry their saved state.
    pub fn build_with<L, P, M>(
        self,
        listener: L,
        protocol: P,
        registrations: M,
    ) -> Result<InvalidationClient<L, P, M>>
    where
        L: InvalidationListener,
        P: ProtocolHandler,
        M: RegistrationManager,
    {
        self.config.validate()?;
        let rng = self
            .rng
            .unwrap_or_else(|| Box::new(OsRng) as Box<dyn RngCore + Send>);
        let smearer = Smearer::new(rng, self.config.smear_percent);
        let scheduler = Arc::clone(self.resources.scheduler());
        let saved = self.saved_state;

        if let Some(state) = &saved {
            check_state!(
                state.client_token.is_none() || state.nonce.is_none(),
                "Saved state holds both a token and a nonce"
            );
        }

        let tasks = TaskSet::new(&self.config, scheduler, smearer, saved.as_ref().map(|s| &s.tasks));
        let mut client = InvalidationClient {
            config: self.config,
            client_id: self.client_id,
            resources: self.resources,
            listener,
            protocol,
            registrations,
            tasks,
            statistics: Statistics::new(),
            client_token: None,
            nonce: None,
            should_send_registrations: false,
            is_online: true,
            run_state: RunState::NotStarted,
            last_message_send_time: Timestamp::default(),
            next_perf_send_time: Timestamp::default(),
            last_written: None,
            pending_write: None,
        };

        if let Some(state) = saved {
            client.client_token = state.client_token;
            client.nonce = state.nonce;
            client.last_message_send_time = Timestamp::new(state.last_message_send_time_ms);
            client.should_send_registrations = state.should_send_registrations;
            client.is_online = state.is_online;
            client.run_state = state.run_state;
            client.statistics = Statistics::from_state(&state.statistics);
            client.last_written = state.last_written_state;
            client.next_perf_send_time = Timestamp::new(state.next_perf_send_time_ms);
            client.tasks.rearm_restored();
            info!(
                "Restored client in state {:?} with token {:?}",
                client.run_state, client.client_token
            );
        }

        // After restoring is_online, so a status the network reports on
        // registration is not overwritten by the saved value
        let sink = Arc::clone(client.resources.event_sink());
        client.resources.network().register_listener(sink);
        Ok(client)
    }
}

// ----------------------------------------------------------------------------
// Invalidation Client
// ----------------------------------------------------------------------------

/// One logical subscription session with the invalidation server
pub struct InvalidationClient<L, P = BatchingProtocolHandler, M = DigestRegistrationManager> {
    config: ClientConfig,
    client_id: ApplicationClientId,
    resources: Arc<SystemResources>,
    listener: L,
    protocol: P,
    registrations: M,
    tasks: TaskSet,
    statistics: Statistics,
    client_token: Option<ClientToken>,
    nonce: Option<Nonce>,
    /// Suppresses registration sends until the server's summary is known
    should_send_registrations: bool,
    is_online: bool,
    run_state: RunState,
    last_message_send_time: Timestamp,
    next_perf_send_time: Timestamp,
    last_written: Option<PersistentTiclState>,
    /// State handed to storage whose completion has not arrived yet
    pending_write: Option<PersistentTiclState>,
}

impl<L, P, M> InvalidationClient<L, P, M>
where
    L: InvalidationListener,
    P: ProtocolHandler,
    M: RegistrationManager,
{
    /// Process one event on the internal thread
    pub fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        self.check_on_internal_thread()?;
        match event {
            ClientEvent::TaskFired(name) => self.handle_task_fired(name),
            ClientEvent::MessageReceived(bytes) => self.handle_incoming_message(&bytes),
            ClientEvent::OnlineStatusChanged(is_online) => {
                self.handle_network_status_change(is_online);
                Ok(())
            }
            ClientEvent::AddressChanged => {
                // The header of the next message carries the new address
                self.send_info_message_to_server(false, false);
                Ok(())
            }
            ClientEvent::PersistentStateRead(result) => self.handle_persistent_state_read(result),
            ClientEvent::PersistentStateWritten(result) => {
                self.handle_persistent_write_result(result);
                Ok(())
            }
        }
    }

    pub fn marshal(&self) -> ClientState {
        ClientState {
            client_token: self.client_token.clone(),
            nonce: self.nonce.clone(),
            last_message_send_time_ms: self.last_message_send_time.as_millis(),
            should_send_registrations: self.should_send_registrations,
            is_online: self.is_online,
            run_state: self.run_state,
            registration_manager: self.registrations.marshal(),
            protocol_handler: self.protocol.marshal(),
            statistics: self.statistics.marshal(),
            tasks: self.tasks.marshal(),
            last_written_state: self.last_written.clone(),
            next_perf_send_time_ms: self.next_perf_send_time.as_millis(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn client_token(&self) -> Option<&ClientToken> {
        self.client_token.as_ref()
    }

    pub fn nonce(&self) -> Option<&Nonce> {
        self.nonce.as_ref()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_started(&self) -> bool {
        self.run_state.is_started()
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn should_send_registrations(&self) -> bool {
        self.should_send_registrations
    }

    pub fn last_message_send_time(&self) -> Timestamp {
        self.last_message_send_time
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &ApplicationClientId {
        &self.client_id
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn registration_manager(&self) -> &M {
        &self.registrations
    }

    pub fn protocol_handler(&self) -> &P {
        &self.protocol
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    // ------------------------------------------------------------------------
    // Shared Helpers
    // ------------------------------------------------------------------------

    fn now(&self) -> Timestamp {
        self.resources.scheduler().now()
    }

    fn check_on_internal_thread(&self) -> Result<()> {
        check_state!(
            self.resources.scheduler().is_running_on_thread(),
            "Not running on internal thread"
        );
        Ok(())
    }

    /// Invoke the listener and count the callback
    fn notify(&mut self, event: ListenerEventType, call: impl FnOnce(&mut L)) {
        self.statistics.record_listener_event(event);
        call(&mut self.listener);
    }

    /// Set or clear the nonce; a nonce may only be set while there is no token
    fn set_nonce(&mut self, new_nonce: Option<Nonce>) -> Result<()> {
        check_state!(
            new_nonce.is_none() || self.client_token.is_none(),
            "Tried to set nonce with existing token {:?}",
            self.client_token
        );
        self.nonce = new_nonce;
        Ok(())
    }

    /// Set or clear the token; a token may only be set while there is no
    /// nonce. The first token ever assigned finishes starting the client.
    fn set_client_token(&mut self, new_token: Option<ClientToken>) -> Result<()> {
        check_state!(
            new_token.is_none() || self.nonce.is_none(),
            "Tried to set token with existing nonce {:?}",
            self.nonce
        );
        let finish_starting = self.run_state == RunState::NotStarted
            && self.client_token.is_none()
            && new_token.is_some();
        self.client_token = new_token;
        if finish_starting {
            self.finish_starting_and_inform_listener();
        }
        Ok(())
    }

    fn finish_starting_and_inform_listener(&mut self) {
        self.run_state.start();
        self.notify(ListenerEventType::Ready, |listener| listener.ready());
        // Registration digests are not persisted, so the application is
        // always asked for its full registration set
        self.notify(ListenerEventType::ReissueRegistrations, |listener| {
            listener.reissue_registrations(&[], 0)
        });
        info!("Client started with token {:?}", self.client_token);
    }

    /// Drop the token and arrange for a new one to be requested
    fn acquire_token(&mut self, reason: &str) -> Result<()> {
        self.set_client_token(None)?;
        if self.nonce.is_none() {
            self.set_nonce(Some(Nonce::from_time(self.now())))?;
        }
        self.tasks.ensure_scheduled(TaskName::AcquireToken, reason);
        Ok(())
    }

    fn send_info_message_to_server(&mut self, must_send_performance_counters: bool, request_server_summary: bool) {
        let (counters, config) = if must_send_performance_counters {
            (
                self.statistics.non_zero_statistics(),
                Some(self.config.as_counters()),
            )
        } else {
            (Vec::new(), None)
        };
        debug!(
            "Sending info message (counters: {}, summary requested: {})",
            must_send_performance_counters, request_server_summary
        );
        self.protocol.send_info_message(
            counters,
            config,
            request_server_summary,
            &mut BatchingTrigger::new(&mut self.tasks),
        );
    }
}
