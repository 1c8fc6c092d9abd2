//! Bodies of the recurring tasks
//!
//! Each policy returns whether its task should be retried; see
//! [`crate::recurring_task::RecurringTask::finish_run`].

use tracing::{debug, error, info, warn};

use super::InvalidationClient;
use crate::errors::{Result, StorageError};
use crate::listener::InvalidationListener;
use crate::persistence::{serialize_state, PersistentTiclState, CLIENT_TOKEN_KEY};
use crate::protocol::{OutboundHeader, ProtocolHandler};
use crate::recurring_task::TaskName;
use crate::registration::RegistrationManager;
use crate::resources::{ClientEvent, Completion};
use crate::statistics::ClientErrorType;
use crate::tasks::BatchingTrigger;
use crate::types::Nonce;

impl<L, P, M> InvalidationClient<L, P, M>
where
    L: InvalidationListener,
    P: ProtocolHandler,
    M: RegistrationManager,
{
    pub(super) fn handle_task_fired(&mut self, name: TaskName) -> Result<()> {
        if !self.tasks.begin_run(name) {
            warn!("[{}] Ignoring firing with no pending run", name);
            return Ok(());
        }
        let reschedule = match name {
            TaskName::AcquireToken => self.run_acquire_token()?,
            TaskName::RegSyncHeartbeat => self.run_reg_sync_heartbeat(),
            TaskName::PersistentWrite => self.run_persistent_write(),
            TaskName::Heartbeat => self.run_heartbeat(),
            TaskName::Batching => self.run_batching(),
            TaskName::InitialPersistentHeartbeat => self.run_initial_persistent_heartbeat(),
        };
        self.tasks.finish_run(name, reschedule);
        Ok(())
    }

    /// Request a token until one is assigned
    fn run_acquire_token(&mut self) -> Result<bool> {
        if self.client_token.is_some() {
            return Ok(false);
        }
        let nonce = Nonce::from_time(self.now());
        self.set_nonce(Some(nonce.clone()))?;
        self.protocol.send_initialize_message(
            &self.client_id,
            &nonce,
            &mut BatchingTrigger::new(&mut self.tasks),
            "AcquireToken",
        );
        // Retry after the timeout in case the server never answers
        Ok(true)
    }

    fn run_reg_sync_heartbeat(&mut self) -> bool {
        if self.registrations.is_state_in_sync_with_server() {
            debug!("Registration state in sync with server");
            return false;
        }
        info!("Registration state not in sync with server; requesting summary");
        self.send_info_message_to_server(false, true);
        true
    }

    /// Write the token until storage holds what is in memory
    fn run_persistent_write(&mut self) -> bool {
        let Some(client_token) = self.client_token.clone() else {
            return false;
        };
        let state = PersistentTiclState {
            client_token,
            last_message_send_time_ms: self.last_message_send_time.as_millis(),
        };
        if state.is_covered_by(
            self.last_written.as_ref(),
            self.config.channel_supports_offline_delivery,
        ) {
            debug!("Persisted state is current; nothing to write");
            return false;
        }
        if self.pending_write.is_some() {
            debug!("Persistent write still outstanding; checking again later");
            return true;
        }

        let bytes = match serialize_state(&state) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Could not encode persistent state: {}", e);
                self.statistics.record_error(ClientErrorType::PersistentWriteFailure);
                return true;
            }
        };
        info!("Writing token {} to persistent storage", state.client_token);
        self.pending_write = Some(state);
        let done = Completion::new(
            self.resources.event_sink().clone(),
            ClientEvent::PersistentStateWritten,
        );
        self.resources.storage().write_key(CLIENT_TOKEN_KEY, bytes, done);
        // Checked again after the retry delay, once the write has completed
        true
    }

    pub(super) fn handle_persistent_write_result(&mut self, result: core::result::Result<(), StorageError>) {
        let Some(written) = self.pending_write.take() else {
            warn!("Persistent write completion with no outstanding write");
            return;
        };
        match result {
            Ok(()) => {
                info!("Persistent state written");
                self.last_written = Some(written);
            }
            Err(e) => {
                warn!("Persistent write failed: {}", e);
                self.statistics.record_error(ClientErrorType::PersistentWriteFailure);
            }
        }
    }

    fn run_heartbeat(&mut self) -> bool {
        let now = self.now();
        // Counters go out only while the next send time is still ahead;
        // starting from zero this never holds unless a restored state set it
        let must_send_performance_counters = self.next_perf_send_time > now;
        if must_send_performance_counters {
            self.next_perf_send_time = now + self.tasks.smeared(self.config.perf_counter_delay());
        }
        info!("Sending heartbeat to server");
        let request_summary = !self.registrations.is_state_in_sync_with_server();
        self.send_info_message_to_server(must_send_performance_counters, request_summary);
        true
    }

    fn run_batching(&mut self) -> bool {
        let header = OutboundHeader {
            client_token: self.client_token.clone(),
            registration_summary: self.registrations.registration_summary(),
            now: self.now(),
        };
        let sent = self.protocol.send_message_to_server(
            &header,
            self.resources.network().as_ref(),
            &mut self.statistics,
        );
        if sent {
            self.handle_message_sent();
        }
        false
    }

    fn run_initial_persistent_heartbeat(&mut self) -> bool {
        self.send_info_message_to_server(false, true);
        false
    }

    fn handle_message_sent(&mut self) {
        self.last_message_send_time = self.now();
        if self.config.channel_supports_offline_delivery {
            // The send time is part of the persisted state in this mode
            self.tasks.ensure_scheduled(TaskName::PersistentWrite, "Sent-message");
        }
    }
}
