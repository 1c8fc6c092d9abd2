//! Core types for the invalidation client
//!
//! This module defines the values exchanged between the application, the
//! session and the server, using newtype patterns for the opaque byte
//! identifiers so a token can never be confused with a nonce.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Opaque Session Identifiers
// ----------------------------------------------------------------------------

macro_rules! opaque_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }
    };
}

opaque_bytes! {
    /// Server-issued identifier of an active session
    ClientToken
}

opaque_bytes! {
    /// Client-chosen correlator for a pending token request
    Nonce
}

opaque_bytes! {
    /// Opaque handle the application passes back to acknowledge an invalidation
    AckHandle
}

impl Nonce {
    /// Nonce derived from the current time, as the server expects a
    /// decimal millisecond string
    pub fn from_time(now: Timestamp) -> Self {
        Self(now.as_millis().to_string().into_bytes())
    }
}

// ----------------------------------------------------------------------------
// Object Identifiers
// ----------------------------------------------------------------------------

/// Source value reserved for objects defined by the protocol itself
pub const INTERNAL_OBJECT_SOURCE: i32 = 1;

/// Name of the sentinel object that stands for "every object"
const ALL_OBJECTS_NAME: &[u8] = b"ALL";

/// Identifier of an object the application can register interest in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub source: i32,
    pub name: Vec<u8>,
}

impl ObjectId {
    pub fn new(source: i32, name: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            name: name.into(),
        }
    }

    /// The sentinel carried by an invalidate-all message
    pub fn all_objects() -> Self {
        Self::new(INTERNAL_OBJECT_SOURCE, ALL_OBJECTS_NAME)
    }

    pub fn is_all_objects(&self) -> bool {
        self.source == INTERNAL_OBJECT_SOURCE && self.name == ALL_OBJECTS_NAME
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, String::from_utf8_lossy(&self.name))
    }
}

/// Identifier of the application instance requesting a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationClientId {
    pub client_type: i32,
    pub client_name: Vec<u8>,
}

impl ApplicationClientId {
    pub fn new(client_type: i32, client_name: impl Into<Vec<u8>>) -> Self {
        Self {
            client_type,
            client_name: client_name.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Invalidations
// ----------------------------------------------------------------------------

/// A server notification that an object changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub object_id: ObjectId,
    pub version: i64,
    pub payload: Option<Vec<u8>>,
    pub is_known_version: bool,
}

impl Invalidation {
    pub fn new(object_id: ObjectId, version: i64) -> Self {
        Self {
            object_id,
            version,
            payload: None,
            is_known_version: true,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Mark this invalidation as not carrying an authoritative version
    pub fn unknown_version(mut self) -> Self {
        self.is_known_version = false;
        self
    }

    /// Minimal well-formedness check applied to acknowledged invalidations
    pub fn is_valid(&self) -> bool {
        !self.object_id.name.is_empty()
    }

    /// Copy of this invalidation without its payload
    pub fn without_payload(&self) -> Self {
        Self {
            payload: None,
            ..self.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

/// Kind of registration change requested by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationOp {
    Register,
    Unregister,
}

/// Registration state reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Registered,
    Unregistered,
}

impl From<RegistrationOp> for RegistrationState {
    fn from(op: RegistrationOp) -> Self {
        match op {
            RegistrationOp::Register => RegistrationState::Registered,
            RegistrationOp::Unregister => RegistrationState::Unregistered,
        }
    }
}

// ----------------------------------------------------------------------------
// Errors reported to the application
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    AuthFailure,
    UnknownFailure,
}

/// Error surfaced through [`crate::InvalidationListener::inform_error`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub reason: ErrorReason,
    pub is_transient: bool,
    pub message: String,
}

// ----------------------------------------------------------------------------
// Run State
// ----------------------------------------------------------------------------

/// Lifecycle of a client session
///
/// The only transitions are `NotStarted -> Started` and `Started -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    NotStarted,
    Started,
    Stopped,
}

impl RunState {
    pub fn is_started(&self) -> bool {
        matches!(self, RunState::Started)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, RunState::Stopped)
    }

    /// Move to `Started`; returns false if not in `NotStarted`
    pub fn start(&mut self) -> bool {
        if *self == RunState::NotStarted {
            *self = RunState::Started;
            true
        } else {
            false
        }
    }

    /// Move to `Stopped`; returns false unless currently `Started`
    pub fn stop(&mut self) -> bool {
        if *self == RunState::Started {
            *self = RunState::Stopped;
            true
        } else {
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
