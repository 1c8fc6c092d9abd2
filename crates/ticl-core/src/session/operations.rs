//! Application-facing operations and startup

use tracing::{debug, info, warn};

use super::InvalidationClient;
use crate::errors::{Result, StorageError, TiclError};
use crate::listener::InvalidationListener;
use crate::persistence::{deserialize_state, PersistentTiclState, CLIENT_TOKEN_KEY};
use crate::protocol::wire::AckHandlePayload;
use crate::protocol::ProtocolHandler;
use crate::recurring_task::TaskName;
use crate::registration::RegistrationManager;
use crate::resources::{ClientEvent, Completion};
use crate::statistics::{ClientErrorType, IncomingOperationType, ListenerEventType};
use crate::tasks::{initial_persistent_heartbeat_delay, BatchingTrigger};
use crate::types::{AckHandle, Nonce, ObjectId, RegistrationOp, RunState, Timestamp};

impl<L, P, M> InvalidationClient<L, P, M>
where
    L: InvalidationListener,
    P: ProtocolHandler,
    M: RegistrationManager,
{
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Begin starting the client
    ///
    /// Seeds a nonce and reads the persisted token; the client becomes
    /// started, and the listener's `ready` fires, once a token is assigned
    /// either from storage or by the server.
    pub fn start(&mut self) -> Result<()> {
        self.check_on_internal_thread()?;
        if !self.resources.is_started() {
            return Err(TiclError::ResourcesNotStarted);
        }
        if self.run_state != RunState::NotStarted || self.nonce.is_some() || self.client_token.is_some() {
            warn!("Ignoring start: client already started ({:?})", self.run_state);
            return Err(TiclError::AlreadyStarted);
        }

        // Exactly one of nonce and token is set from here on
        self.set_nonce(Some(Nonce::from_time(self.now())))?;
        info!("Starting client; reading persisted state");
        let done = Completion::new(
            self.resources.event_sink().clone(),
            ClientEvent::PersistentStateRead,
        );
        self.resources.storage().read_key(CLIENT_TOKEN_KEY, done);
        Ok(())
    }

    /// Stop the client. Registration calls made afterwards are dropped.
    pub fn stop(&mut self) -> Result<()> {
        self.check_on_internal_thread()?;
        match self.run_state {
            RunState::Stopped => info!("Client already stopped"),
            RunState::NotStarted => warn!("Ignoring stop of a client that has not started"),
            RunState::Started => {
                self.run_state.stop();
                info!("Client stopped");
            }
        }
        Ok(())
    }

    pub(super) fn handle_persistent_state_read(&mut self, result: core::result::Result<Vec<u8>, StorageError>) -> Result<()> {
        if self.run_state != RunState::NotStarted || self.client_token.is_some() {
            warn!("Ignoring persisted state read after startup completed");
            return Ok(());
        }

        let persisted = match result {
            Ok(bytes) => match deserialize_state(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Discarding unreadable persisted state: {}", e);
                    self.statistics.record_error(ClientErrorType::PersistentDeserializationFailure);
                    None
                }
            },
            // A missing key is an ordinary first start, so unlike other read
            // errors it does not count as a PersistentReadFailure
            Err(StorageError::KeyNotFound { .. }) => {
                debug!("No persisted state found");
                None
            }
            Err(e) => {
                warn!("Could not read persisted state: {}", e);
                self.statistics.record_error(ClientErrorType::PersistentReadFailure);
                None
            }
        };
        self.start_internal(persisted)
    }

    fn start_internal(&mut self, persisted: Option<PersistentTiclState>) -> Result<()> {
        match persisted {
            None => {
                info!("Starting with no previous state");
                self.should_send_registrations = true;
                self.acquire_token("Startup")
            }
            Some(state) => {
                info!("Starting with persisted token {}", state.client_token);
                let last_send = Timestamp::new(state.last_message_send_time_ms);
                // The server most likely still holds our registrations
                self.should_send_registrations = false;
                self.set_nonce(None)?;
                self.set_client_token(Some(state.client_token.clone()))?;
                self.last_written = Some(state);

                let delay = initial_persistent_heartbeat_delay(&self.config, self.now(), last_send);
                self.tasks
                    .get_mut(TaskName::InitialPersistentHeartbeat)
                    .set_initial_delay(delay);
                self.tasks
                    .ensure_scheduled(TaskName::InitialPersistentHeartbeat, "Startup-after-persistence");
                self.tasks
                    .ensure_scheduled(TaskName::Heartbeat, "Startup-after-persistence");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Registrations
    // ------------------------------------------------------------------------

    pub fn register(&mut self, object_id: ObjectId) -> Result<()> {
        self.perform_register_operations(&[object_id], RegistrationOp::Register)
    }

    pub fn register_all(&mut self, object_ids: &[ObjectId]) -> Result<()> {
        self.perform_register_operations(object_ids, RegistrationOp::Register)
    }

    pub fn unregister(&mut self, object_id: ObjectId) -> Result<()> {
        self.perform_register_operations(&[object_id], RegistrationOp::Unregister)
    }

    pub fn unregister_all(&mut self, object_ids: &[ObjectId]) -> Result<()> {
        self.perform_register_operations(object_ids, RegistrationOp::Unregister)
    }

    fn perform_register_operations(&mut self, object_ids: &[ObjectId], op: RegistrationOp) -> Result<()> {
        self.check_on_internal_thread()?;
        match self.run_state {
            RunState::Stopped => {
                // Possibly a call that raced with stop
                warn!("Client stopped: {:?} of {} objects ignored", op, object_ids.len());
                return Ok(());
            }
            RunState::NotStarted => {
                warn!("Client not started: {:?} of {} objects rejected", op, object_ids.len());
                return Err(TiclError::NotStarted);
            }
            RunState::Started => {}
        }
        if object_ids.is_empty() {
            return Err(TiclError::EmptyObjectSet);
        }

        let operation_type = match op {
            RegistrationOp::Register => IncomingOperationType::Registration,
            RegistrationOp::Unregister => IncomingOperationType::Unregistration,
        };
        for object_id in object_ids {
            self.statistics.record_incoming_operation(operation_type);
            info!("{:?} {}", op, object_id);
            // Report success right away so the application hears about it even
            // if the server's reply is lost; only failures are reported later
            self.notify(ListenerEventType::InformRegistrationStatus, |listener| {
                listener.inform_registration_status(object_id, op.into())
            });
        }

        let to_send = self.registrations.perform_operations(object_ids, op);
        if self.should_send_registrations && !to_send.is_empty() {
            self.protocol
                .send_registrations(&to_send, op, &mut BatchingTrigger::new(&mut self.tasks));
        }
        self.tasks
            .ensure_scheduled(TaskName::RegSyncHeartbeat, "performRegister");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Acknowledgements
    // ------------------------------------------------------------------------

    /// Acknowledge an invalidation. Malformed handles are counted and dropped.
    /// The run state is not checked; an ack queued before a token exists is
    /// dropped at flush time.
    pub fn acknowledge(&mut self, ack_handle: &AckHandle) -> Result<()> {
        self.check_on_internal_thread()?;
        let payload = match AckHandlePayload::from_handle(ack_handle) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad ack handle {}: {}", ack_handle, e);
                self.statistics.record_error(ClientErrorType::AcknowledgeHandleFailure);
                return Ok(());
            }
        };
        let Some(invalidation) = payload.invalidation.filter(|inv| inv.is_valid()) else {
            warn!("Ack handle without a valid invalidation: {}", ack_handle);
            self.statistics.record_error(ClientErrorType::AcknowledgeHandleFailure);
            return Ok(());
        };

        // Payloads only travel from server to client
        let invalidation = invalidation.without_payload();
        self.statistics.record_incoming_operation(IncomingOperationType::Acknowledge);
        self.protocol
            .send_invalidation_ack(&invalidation, &mut BatchingTrigger::new(&mut self.tasks));
        Ok(())
    }
}
