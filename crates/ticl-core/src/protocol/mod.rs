//! Outbound batching and inbound parsing of server messages
//!
//! The session talks to the server only through a [`ProtocolHandler`]:
//! `send_*` calls queue sub-messages and request a flush through the
//! [`BatchingTrigger`]; when the Batching task fires the session calls
//! [`ProtocolHandler::send_message_to_server`] to emit one wire message.

pub mod handler;
pub mod wire;

use serde::{Deserialize, Serialize};

use crate::resources::NetworkChannel;
use crate::statistics::Statistics;
use crate::tasks::BatchingTrigger;
use crate::types::{ApplicationClientId, ClientToken, Invalidation, Nonce, ObjectId, RegistrationOp, Timestamp};

pub use handler::BatchingProtocolHandler;
pub use wire::{
    ErrorMessage, InfoMessage, InfoRequestMessage, InfoType, InitializeMessage, Registration,
    RegistrationStatus, RegistrationSubtree, RegistrationSummary, TokenControlMessage,
};

/// Session values stamped into the header of every outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundHeader {
    pub client_token: Option<ClientToken>,
    pub registration_summary: RegistrationSummary,
    pub now: Timestamp,
}

/// Header fields of a parsed server message the session acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessageHeader {
    /// Token (or pending nonce) the message is addressed to
    pub token: Vec<u8>,
    pub registration_summary: Option<RegistrationSummary>,
}

/// A validated server message; every sub-message is independently optional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub header: ServerMessageHeader,
    pub token_control: Option<TokenControlMessage>,
    pub invalidations: Option<Vec<Invalidation>>,
    pub registration_statuses: Option<Vec<RegistrationStatus>>,
    pub registration_sync_request: bool,
    pub info_request: Option<InfoRequestMessage>,
    pub error: Option<ErrorMessage>,
}

/// Sub-messages queued for the next flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherState {
    pub pending_initialize: Option<InitializeMessage>,
    pub pending_registrations: Vec<Registration>,
    pub pending_acks: Vec<Invalidation>,
    pub pending_subtrees: Vec<RegistrationSubtree>,
    pub pending_info: Option<InfoMessage>,
}

/// Marshalled protocol handler state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHandlerState {
    pub message_id: u64,
    pub last_known_server_time_ms: u64,
    pub batcher: BatcherState,
}

pub trait ProtocolHandler {
    /// Queue a token request stamped with `nonce`
    fn send_initialize_message(
        &mut self,
        client_id: &ApplicationClientId,
        nonce: &Nonce,
        batching: &mut BatchingTrigger<'_>,
        debug_string: &str,
    );

    fn send_registrations(
        &mut self,
        objects: &[ObjectId],
        op: RegistrationOp,
        batching: &mut BatchingTrigger<'_>,
    );

    fn send_invalidation_ack(&mut self, invalidation: &Invalidation, batching: &mut BatchingTrigger<'_>);

    fn send_registration_sync_subtree(
        &mut self,
        subtree: RegistrationSubtree,
        batching: &mut BatchingTrigger<'_>,
    );

    /// Queue an info message; `config_parameters` is only present alongside
    /// performance counters
    fn send_info_message(
        &mut self,
        performance_counters: Vec<(String, u64)>,
        config_parameters: Option<Vec<(String, u64)>>,
        request_server_summary: bool,
        batching: &mut BatchingTrigger<'_>,
    );

    /// Flush everything queued as one message. Returns whether a message was sent.
    fn send_message_to_server(
        &mut self,
        header: &OutboundHeader,
        network: &dyn NetworkChannel,
        statistics: &mut Statistics,
    ) -> bool;

    /// Parse raw bytes from the server; `None` if the message must be dropped
    fn handle_incoming_message(&mut self, message: &[u8], statistics: &mut Statistics) -> Option<ParsedMessage>;

    fn marshal(&self) -> ProtocolHandlerState;
}
