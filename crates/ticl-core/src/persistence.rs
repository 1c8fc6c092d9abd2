//! Persisted session token
//!
//! The only state that must survive a process restart is the session token
//! and the time the client last sent a message. It is stored under
//! [`CLIENT_TOKEN_KEY`] as a bincode blob carrying a SHA-256 authentication
//! code over the encoded state, so a truncated or tampered blob is treated
//! the same as no blob at all.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{PersistenceError, Result};
use crate::types::ClientToken;

/// Storage key of the persisted state blob
pub const CLIENT_TOKEN_KEY: &str = "ClientToken";

/// State written to storage by the PersistentWrite task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentTiclState {
    pub client_token: ClientToken,
    pub last_message_send_time_ms: u64,
}

impl PersistentTiclState {
    /// Whether writing `self` would add nothing to a store holding `written`.
    /// Without offline delivery only the token matters.
    pub fn is_covered_by(&self, written: Option<&PersistentTiclState>, offline_delivery: bool) -> bool {
        match written {
            Some(written) if offline_delivery => written == self,
            Some(written) => written.client_token == self.client_token,
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistentStateBlob {
    state: Vec<u8>,
    authentication_code: Vec<u8>,
}

fn authentication_code(encoded_state: &[u8]) -> Vec<u8> {
    Sha256::digest(encoded_state).to_vec()
}

/// Encode `state` into an authenticated blob
pub fn serialize_state(state: &PersistentTiclState) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(state)?;
    let blob = PersistentStateBlob {
        authentication_code: authentication_code(&encoded),
        state: encoded,
    };
    Ok(bincode::serialize(&blob)?)
}

/// Decode a blob written by [`serialize_state`]
pub fn deserialize_state(bytes: &[u8]) -> core::result::Result<PersistentTiclState, PersistenceError> {
    let blob: PersistentStateBlob =
        bincode::deserialize(bytes).map_err(|e| PersistenceError::Corrupt {
            reason: e.to_string(),
        })?;
    if authentication_code(&blob.state) != blob.authentication_code {
        return Err(PersistenceError::DigestMismatch);
    }
    let state: PersistentTiclState =
        bincode::deserialize(&blob.state).map_err(|e| PersistenceError::Corrupt {
            reason: e.to_string(),
        })?;
    if state.client_token.is_empty() {
        return Err(PersistenceError::Corrupt {
            reason: "empty client token".to_string(),
        });
    }
    Ok(state)
}
