//! Default protocol handler: batches sub-messages into bincode wire messages

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::wire::{
    ClientHeader, ClientToServerMessage, InfoMessage, InitializeMessage, Registration,
    RegistrationSubtree, ServerToClientMessage, CLIENT_VERSION, PROTOCOL_VERSION,
};
use super::{
    BatcherState, OutboundHeader, ParsedMessage, ProtocolHandler, ProtocolHandlerState, ServerMessageHeader,
};
use crate::config::ProtocolHandlerConfig;
use crate::resources::NetworkChannel;
use crate::statistics::{ClientErrorType, SentMessageType, Statistics};
use crate::tasks::BatchingTrigger;
use crate::types::{ApplicationClientId, Invalidation, Nonce, ObjectId, RegistrationOp};

/// Accumulates outbound sub-messages until the Batching task flushes them
#[derive(Debug)]
pub struct BatchingProtocolHandler {
    config: ProtocolHandlerConfig,
    message_id: u64,
    last_known_server_time_ms: u64,
    pending_initialize: Option<InitializeMessage>,
    /// Later operations on an object replace earlier ones
    pending_registrations: BTreeMap<ObjectId, RegistrationOp>,
    pending_acks: Vec<Invalidation>,
    pending_subtrees: Vec<RegistrationSubtree>,
    pending_info: Option<InfoMessage>,
}

impl BatchingProtocolHandler {
    pub fn new(config: ProtocolHandlerConfig, saved: Option<ProtocolHandlerState>) -> Self {
        let saved = saved.unwrap_or_default();
        let batcher = saved.batcher;
        Self {
            config,
            message_id: saved.message_id,
            last_known_server_time_ms: saved.last_known_server_time_ms,
            pending_initialize: batcher.pending_initialize,
            pending_registrations: batcher
                .pending_registrations
                .into_iter()
                .map(|registration| (registration.object_id, registration.op))
                .collect(),
            pending_acks: batcher.pending_acks,
            pending_subtrees: batcher.pending_subtrees,
            pending_info: batcher.pending_info,
        }
    }

    pub fn config(&self) -> &ProtocolHandlerConfig {
        &self.config
    }

    /// Whether anything is waiting for the next flush
    pub fn has_pending(&self) -> bool {
        self.pending_initialize.is_some()
            || !self.pending_registrations.is_empty()
            || !self.pending_acks.is_empty()
            || !self.pending_subtrees.is_empty()
            || self.pending_info.is_some()
    }

    pub fn last_known_server_time_ms(&self) -> u64 {
        self.last_known_server_time_ms
    }

    fn take_batch(&mut self, header: ClientHeader, statistics: &mut Statistics) -> ClientToServerMessage {
        let initialize = self.pending_initialize.take();
        if initialize.is_some() {
            statistics.record_sent_message(SentMessageType::Initialize);
        }

        let registrations = if self.pending_registrations.is_empty() {
            None
        } else {
            statistics.record_sent_message(SentMessageType::Registration);
            Some(
                std::mem::take(&mut self.pending_registrations)
                    .into_iter()
                    .map(|(object_id, op)| Registration { object_id, op })
                    .collect(),
            )
        };

        let registration_sync = if self.pending_subtrees.is_empty() {
            None
        } else {
            statistics.record_sent_message(SentMessageType::RegistrationSync);
            Some(std::mem::take(&mut self.pending_subtrees))
        };

        let invalidation_acks = if self.pending_acks.is_empty() {
            None
        } else {
            statistics.record_sent_message(SentMessageType::InvalidationAck);
            Some(std::mem::take(&mut self.pending_acks))
        };

        let info = self.pending_info.take();
        if info.is_some() {
            statistics.record_sent_message(SentMessageType::Info);
        }

        ClientToServerMessage {
            header,
            initialize,
            registrations,
            registration_sync,
            invalidation_acks,
            info,
        }
    }
}

impl ProtocolHandler for BatchingProtocolHandler {
    fn send_initialize_message(
        &mut self,
        client_id: &ApplicationClientId,
        nonce: &Nonce,
        batching: &mut BatchingTrigger<'_>,
        debug_string: &str,
    ) {
        info!("Batching initialize message for client {:?}: {}", client_id, debug_string);
        self.pending_initialize = Some(InitializeMessage {
            client_type: client_id.client_type,
            nonce: nonce.clone(),
            application_client_id: client_id.clone(),
        });
        batching.ensure_scheduled(debug_string);
    }

    fn send_registrations(
        &mut self,
        objects: &[ObjectId],
        op: RegistrationOp,
        batching: &mut BatchingTrigger<'_>,
    ) {
        for object_id in objects {
            self.pending_registrations.insert(object_id.clone(), op);
        }
        batching.ensure_scheduled("Send-registrations");
    }

    fn send_invalidation_ack(&mut self, invalidation: &Invalidation, batching: &mut BatchingTrigger<'_>) {
        if !self.pending_acks.contains(invalidation) {
            self.pending_acks.push(invalidation.clone());
        }
        batching.ensure_scheduled("Send-ack");
    }

    fn send_registration_sync_subtree(
        &mut self,
        subtree: RegistrationSubtree,
        batching: &mut BatchingTrigger<'_>,
    ) {
        if !self.pending_subtrees.contains(&subtree) {
            self.pending_subtrees.push(subtree);
        }
        batching.ensure_scheduled("Send-reg-sync");
    }

    fn send_info_message(
        &mut self,
        performance_counters: Vec<(String, u64)>,
        config_parameters: Option<Vec<(String, u64)>>,
        request_server_summary: bool,
        batching: &mut BatchingTrigger<'_>,
    ) {
        self.pending_info = Some(InfoMessage {
            client_version: CLIENT_VERSION.to_string(),
            config_parameters: config_parameters.unwrap_or_default(),
            performance_counters,
            server_registration_summary_requested: request_server_summary,
        });
        batching.ensure_scheduled("Send-info");
    }

    fn send_message_to_server(
        &mut self,
        header: &OutboundHeader,
        network: &dyn NetworkChannel,
        statistics: &mut Statistics,
    ) -> bool {
        if !self.has_pending() {
            debug!("Nothing batched; skipping send");
            return false;
        }
        if header.client_token.is_none() && self.pending_initialize.is_none() {
            warn!("Cannot send message without a token or a pending initialize message");
            statistics.record_error(ClientErrorType::TokenMissingFailure);
            return false;
        }

        let client_header = ClientHeader {
            protocol_version: PROTOCOL_VERSION,
            client_token: header.client_token.clone(),
            registration_summary: header.registration_summary.clone(),
            client_time_ms: header.now.as_millis(),
            max_known_server_time_ms: self.last_known_server_time_ms,
            message_id: self.message_id.to_string(),
        };
        let message = self.take_batch(client_header, statistics);
        let bytes = match message.to_binary() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                statistics.record_error(ClientErrorType::OutgoingMessageFailure);
                return false;
            }
        };

        debug!(
            "Sending message {} ({} bytes) to server",
            self.message_id,
            bytes.len()
        );
        self.message_id += 1;
        statistics.record_sent_message(SentMessageType::Total);
        network.send_message(bytes);
        true
    }

    fn handle_incoming_message(&mut self, message: &[u8], statistics: &mut Statistics) -> Option<ParsedMessage> {
        let message = match ServerToClientMessage::from_binary(message) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable server message: {}", e);
                statistics.record_error(ClientErrorType::IncomingMessageFailure);
                return None;
            }
        };

        let version = message.header.protocol_version;
        if version.major != PROTOCOL_VERSION.major {
            warn!(
                "Dropping message with protocol version {}.{} (expected major {})",
                version.major, version.minor, PROTOCOL_VERSION.major
            );
            statistics.record_error(ClientErrorType::ProtocolVersionFailure);
            return None;
        }

        if let Err(reason) = validate(&message) {
            warn!("Dropping invalid server message: {}", reason);
            statistics.record_error(ClientErrorType::IncomingMessageFailure);
            return None;
        }

        self.last_known_server_time_ms = self
            .last_known_server_time_ms
            .max(message.header.server_time_ms);

        Some(ParsedMessage {
            header: ServerMessageHeader {
                token: message.header.client_token,
                registration_summary: message.header.registration_summary,
            },
            token_control: message.token_control,
            invalidations: message.invalidations,
            registration_statuses: message.registration_statuses,
            registration_sync_request: message.registration_sync_request,
            info_request: message.info_request,
            error: message.error,
        })
    }

    fn marshal(&self) -> ProtocolHandlerState {
        ProtocolHandlerState {
            message_id: self.message_id,
            last_known_server_time_ms: self.last_known_server_time_ms,
            batcher: BatcherState {
                pending_initialize: self.pending_initialize.clone(),
                pending_registrations: self
                    .pending_registrations
                    .iter()
                    .map(|(object_id, op)| Registration {
                        object_id: object_id.clone(),
                        op: *op,
                    })
                    .collect(),
                pending_acks: self.pending_acks.clone(),
                pending_subtrees: self.pending_subtrees.clone(),
                pending_info: self.pending_info.clone(),
            },
        }
    }
}

fn validate(message: &ServerToClientMessage) -> Result<(), &'static str> {
    if message.header.client_token.is_empty() {
        return Err("empty token in header");
    }
    if let Some(control) = &message.token_control {
        if control.new_token.as_ref().is_some_and(|token| token.is_empty()) {
            return Err("empty new token");
        }
    }
    if let Some(invalidations) = &message.invalidations {
        if invalidations.iter().any(|inv| !inv.is_valid()) {
            return Err("invalidation without object name");
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
