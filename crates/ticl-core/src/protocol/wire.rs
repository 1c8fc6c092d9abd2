//! Wire messages exchanged with the invalidation server
//!
//! Every message is a single bincode-encoded record with a header and a set
//! of optional sub-messages; any subset of the sub-messages may be present.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::types::{
    AckHandle, ApplicationClientId, ClientToken, ErrorReason, Invalidation, Nonce, ObjectId,
    RegistrationOp,
};

// ----------------------------------------------------------------------------
// Protocol Version
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

/// Version spoken by this client; messages with another major version are dropped
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 3, minor: 2 };

/// Library version reported in info messages
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ----------------------------------------------------------------------------
// Shared Records
// ----------------------------------------------------------------------------

/// Compact fingerprint of a registration set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub num_registrations: u32,
    pub registration_digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub object_id: ObjectId,
    pub op: RegistrationOp,
}

/// A set of registered objects sharing a digest prefix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSubtree {
    pub registered_objects: Vec<ObjectId>,
}

// ----------------------------------------------------------------------------
// Client to Server
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeader {
    pub protocol_version: ProtocolVersion,
    pub client_token: Option<ClientToken>,
    pub registration_summary: RegistrationSummary,
    pub client_time_ms: u64,
    pub max_known_server_time_ms: u64,
    pub message_id: String,
}

/// Request for a new session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeMessage {
    pub client_type: i32,
    pub nonce: Nonce,
    pub application_client_id: ApplicationClientId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub client_version: String,
    pub config_parameters: Vec<(String, u64)>,
    pub performance_counters: Vec<(String, u64)>,
    pub server_registration_summary_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToServerMessage {
    pub header: ClientHeader,
    pub initialize: Option<InitializeMessage>,
    pub registrations: Option<Vec<Registration>>,
    pub registration_sync: Option<Vec<RegistrationSubtree>>,
    pub invalidation_acks: Option<Vec<Invalidation>>,
    pub info: Option<InfoMessage>,
}

impl ClientToServerMessage {
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_binary(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

// ----------------------------------------------------------------------------
// Server to Client
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHeader {
    pub protocol_version: ProtocolVersion,
    /// Token or nonce the message is addressed to
    pub client_token: Vec<u8>,
    pub registration_summary: Option<RegistrationSummary>,
    pub server_time_ms: u64,
    pub message_id: Option<String>,
}

/// Assigns a new token, or destroys the current one when `new_token` is absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenControlMessage {
    pub new_token: Option<ClientToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    TransientFailure,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub description: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            description: String::new(),
        }
    }

    pub fn failure(code: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.code == StatusCode::PermanentFailure
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatus {
    pub registration: Registration,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoType {
    GetPerformanceCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoRequestMessage {
    pub info_types: Vec<InfoType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorReason,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToClientMessage {
    pub header: ServerHeader,
    pub token_control: Option<TokenControlMessage>,
    pub invalidations: Option<Vec<Invalidation>>,
    pub registration_statuses: Option<Vec<RegistrationStatus>>,
    pub registration_sync_request: bool,
    pub info_request: Option<InfoRequestMessage>,
    pub error: Option<ErrorMessage>,
}

impl ServerToClientMessage {
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_binary(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

// ----------------------------------------------------------------------------
// Ack Handles
// ----------------------------------------------------------------------------

/// Contents of an [`AckHandle`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHandlePayload {
    pub invalidation: Option<Invalidation>,
}

impl AckHandlePayload {
    pub fn for_invalidation(invalidation: &Invalidation) -> Self {
        Self {
            invalidation: Some(invalidation.clone()),
        }
    }

    pub fn to_handle(&self) -> Result<AckHandle> {
        Ok(AckHandle::new(bincode::serialize(self)?))
    }

    pub fn from_handle(handle: &AckHandle) -> Result<Self> {
        Ok(bincode::deserialize(handle.as_bytes())?)
    }
}
