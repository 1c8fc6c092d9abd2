//! Routing of server messages and network notifications

use tracing::{debug, error, info, warn};

use super::InvalidationClient;
use crate::errors::{check_state, Result};
use crate::listener::InvalidationListener;
use crate::protocol::wire::AckHandlePayload;
use crate::protocol::{
    ErrorMessage, InfoType, ParsedMessage, ProtocolHandler, RegistrationStatus, ServerMessageHeader,
};
use crate::recurring_task::TaskName;
use crate::registration::RegistrationManager;
use crate::statistics::{ClientErrorType, ListenerEventType, ReceivedMessageType};
use crate::tasks::BatchingTrigger;
use crate::types::{ClientToken, ErrorInfo, ErrorReason, Invalidation};

impl<L, P, M> InvalidationClient<L, P, M>
where
    L: InvalidationListener,
    P: ProtocolHandler,
    M: RegistrationManager,
{
    pub(super) fn handle_incoming_message(&mut self, bytes: &[u8]) -> Result<()> {
        self.statistics.record_received_message(ReceivedMessageType::Total);
        let Some(message) = self.protocol.handle_incoming_message(bytes, &mut self.statistics) else {
            return Ok(());
        };
        if !self.validate_token(&message) {
            return Ok(());
        }

        let ParsedMessage {
            header,
            token_control,
            invalidations,
            registration_statuses,
            registration_sync_request,
            info_request,
            error,
        } = message;

        if let Some(control) = token_control {
            self.statistics.record_received_message(ReceivedMessageType::TokenControl);
            self.handle_token_changed(&header.token, control.new_token)?;
        }

        // The token may have been destroyed, or never acquired
        if self.client_token.is_none() {
            return Ok(());
        }

        self.handle_incoming_header(&header)?;

        if let Some(invalidations) = invalidations {
            self.statistics.record_received_message(ReceivedMessageType::Invalidation);
            self.handle_invalidations(invalidations);
        }
        if let Some(statuses) = registration_statuses {
            self.statistics.record_received_message(ReceivedMessageType::RegistrationStatus);
            self.handle_registration_status(statuses)?;
        }
        if registration_sync_request {
            self.statistics
                .record_received_message(ReceivedMessageType::RegistrationSyncRequest);
            self.handle_registration_sync_request();
        }
        if let Some(info) = info_request {
            self.statistics.record_received_message(ReceivedMessageType::InfoRequest);
            self.handle_info_request(&info.info_types);
        }
        if let Some(error) = error {
            self.statistics.record_received_message(ReceivedMessageType::Error);
            self.handle_error_message(error);
        }
        Ok(())
    }

    /// Whether the message is addressed to our token, or to our nonce while
    /// we wait for one
    fn validate_token(&mut self, message: &ParsedMessage) -> bool {
        let header_token = message.header.token.as_slice();
        if let Some(token) = &self.client_token {
            if token.as_bytes() != header_token {
                info!(
                    "Incoming message has bad token: server = {}, client = {}",
                    hex::encode(header_token),
                    token
                );
                self.statistics.record_error(ClientErrorType::TokenMismatch);
                return false;
            }
        } else if let Some(nonce) = &self.nonce {
            if nonce.as_bytes() != header_token {
                info!(
                    "Rejecting server message with mismatched nonce: server = {}, client = {}",
                    hex::encode(header_token),
                    nonce
                );
                self.statistics.record_error(ClientErrorType::NonceMismatch);
                return false;
            }
        } else {
            warn!("Neither token nor nonce is set; dropping message");
            return false;
        }
        true
    }

    fn handle_token_changed(&mut self, header_token: &[u8], new_token: Option<ClientToken>) -> Result<()> {
        match new_token {
            Some(new_token) => {
                check_state!(
                    self.nonce.as_ref().map(|nonce| nonce.as_bytes()) == Some(header_token),
                    "Header token {} does not match nonce {:?}",
                    hex::encode(header_token),
                    self.nonce
                );
                info!("New token assigned: {}", new_token);
                self.set_nonce(None)?;
                self.set_client_token(Some(new_token))?;
                self.tasks.ensure_scheduled(TaskName::PersistentWrite, "Sent-token");
                self.tasks
                    .ensure_scheduled(TaskName::Heartbeat, "Heartbeat-after-new-token");
                Ok(())
            }
            None => {
                info!("Destroying existing token: {:?}", self.client_token);
                self.acquire_token("Destroy")
            }
        }
    }

    fn handle_incoming_header(&mut self, header: &ServerMessageHeader) -> Result<()> {
        check_state!(
            self.nonce.is_none(),
            "Cannot process server header with pending nonce {:?}",
            self.nonce
        );
        if let Some(summary) = &header.registration_summary {
            // The server's view is now known, so registrations may flow again
            self.should_send_registrations = true;
            self.registrations.inform_server_summary(summary);
        }
        Ok(())
    }

    fn handle_invalidations(&mut self, invalidations: Vec<Invalidation>) {
        for invalidation in invalidations {
            let ack_handle = match AckHandlePayload::for_invalidation(&invalidation).to_handle() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Could not build ack handle for {}: {}", invalidation.object_id, e);
                    continue;
                }
            };
            if invalidation.object_id.is_all_objects() {
                debug!("Issuing invalidate-all");
                self.notify(ListenerEventType::InvalidateAll, |listener| {
                    listener.invalidate_all(ack_handle)
                });
            } else if invalidation.is_known_version {
                debug!("Issuing invalidate for {} at {}", invalidation.object_id, invalidation.version);
                self.notify(ListenerEventType::Invalidate, |listener| {
                    listener.invalidate(&invalidation, ack_handle)
                });
            } else {
                debug!("Issuing invalidate-unknown-version for {}", invalidation.object_id);
                self.notify(ListenerEventType::InvalidateUnknown, |listener| {
                    listener.invalidate_unknown_version(&invalidation.object_id, ack_handle)
                });
            }
        }
    }

    fn handle_registration_status(&mut self, statuses: Vec<RegistrationStatus>) -> Result<()> {
        let results = self
            .registrations
            .handle_registration_status(&statuses, &mut self.statistics);
        check_state!(
            results.len() == statuses.len(),
            "Registration manager returned {} results for {} statuses",
            results.len(),
            statuses.len()
        );

        // Successes were already reported when the application registered
        for (status, agreed) in statuses.iter().zip(results) {
            if agreed {
                continue;
            }
            let description = if status.status.is_success() {
                "Registration discrepancy detected".to_string()
            } else {
                status.status.description.clone()
            };
            let is_transient = !status.status.is_permanent_failure();
            let object_id = &status.registration.object_id;
            self.notify(ListenerEventType::InformRegistrationFailure, |listener| {
                listener.inform_registration_failure(object_id, is_transient, &description)
            });
        }
        Ok(())
    }

    fn handle_registration_sync_request(&mut self) {
        let subtree = self.registrations.get_registrations(&[], 0);
        debug!(
            "Sending registration sync subtree with {} objects",
            subtree.registered_objects.len()
        );
        self.protocol
            .send_registration_sync_subtree(subtree, &mut BatchingTrigger::new(&mut self.tasks));
    }

    fn handle_info_request(&mut self, info_types: &[InfoType]) {
        let must_send_performance_counters = info_types.contains(&InfoType::GetPerformanceCounters);
        let request_summary = !self.registrations.is_state_in_sync_with_server();
        self.send_info_message_to_server(must_send_performance_counters, request_summary);
    }

    fn handle_error_message(&mut self, message: ErrorMessage) {
        error!("Received error message: {:?}, {}", message.code, message.description);
        let info = ErrorInfo {
            reason: message.code,
            is_transient: false,
            message: message.description.clone(),
        };
        self.notify(ListenerEventType::InformError, |listener| listener.inform_error(&info));

        if message.code != ErrorReason::AuthFailure {
            return;
        }
        let removed = self.registrations.remove_all();
        warn!("Issuing failure for {} objects after auth error", removed.len());
        let description = format!("Auth error: {}", message.description);
        for object_id in &removed {
            self.notify(ListenerEventType::InformRegistrationFailure, |listener| {
                listener.inform_registration_failure(object_id, false, &description)
            });
        }
    }

    pub(super) fn handle_network_status_change(&mut self, is_online: bool) {
        let was_online = self.is_online;
        self.is_online = is_online;
        let threshold = self.last_message_send_time + self.config.offline_heartbeat_threshold();
        if is_online && !was_online && self.now() > threshold {
            info!("Back online after a long silence; sending heartbeat");
            let request_summary = !self.registrations.is_state_in_sync_with_server();
            self.send_info_message_to_server(false, request_summary);
        }
    }
}
