//! Client statistics
//!
//! Monotonic counters keyed by event-type enumerations. The non-zero
//! counters are what the client reports to the server as performance
//! counters, and the whole set is marshalled with the client state.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

// ----------------------------------------------------------------------------
// Counter Groups
// ----------------------------------------------------------------------------

macro_rules! counter_enum {
    ($(#[$meta:meta])* $name:ident, $group:literal { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($variant) => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn group() -> &'static str {
                $group
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", $group, self.as_str())
            }
        }
    };
}

counter_enum! {
    /// Messages sent to the server, by contained sub-message
    SentMessageType, "SentMessageType" {
        Info,
        Initialize,
        InvalidationAck,
        Registration,
        RegistrationSync,
        Total,
    }
}

counter_enum! {
    /// Operations requested by the application
    IncomingOperationType, "IncomingOperationType" {
        Acknowledge,
        Registration,
        Unregistration,
    }
}

counter_enum! {
    /// Messages received from the server, by contained sub-message
    ReceivedMessageType, "ReceivedMessageType" {
        InfoRequest,
        Invalidation,
        RegistrationStatus,
        RegistrationSyncRequest,
        TokenControl,
        Error,
        Total,
    }
}

counter_enum! {
    /// Callbacks issued to the application listener
    ListenerEventType, "ListenerEventType" {
        InformError,
        InformRegistrationFailure,
        InformRegistrationStatus,
        Invalidate,
        InvalidateAll,
        InvalidateUnknown,
        Ready,
        ReissueRegistrations,
    }
}

counter_enum! {
    /// Locally detected faults
    ClientErrorType, "ClientErrorType" {
        AcknowledgeHandleFailure,
        IncomingMessageFailure,
        OutgoingMessageFailure,
        PersistentDeserializationFailure,
        PersistentReadFailure,
        PersistentWriteFailure,
        ProtocolVersionFailure,
        RegistrationDiscrepancy,
        NonceMismatch,
        TokenMismatch,
        TokenMissingFailure,
        TokenTransientFailure,
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Marshalled statistics: one `(name, value)` pair per non-zero counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsState {
    pub counters: Vec<(String, u64)>,
}

/// Counters for every event type the client tracks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    sent_messages: BTreeMap<SentMessageType, u64>,
    incoming_operations: BTreeMap<IncomingOperationType, u64>,
    received_messages: BTreeMap<ReceivedMessageType, u64>,
    listener_events: BTreeMap<ListenerEventType, u64>,
    client_errors: BTreeMap<ClientErrorType, u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild statistics from marshalled counters; unknown names are skipped
    pub fn from_state(state: &StatisticsState) -> Self {
        let mut statistics = Self::new();
        for (name, value) in &state.counters {
            if !statistics.set_by_name(name, *value) {
                warn!("Ignoring unknown statistics counter {} = {}", name, value);
            }
        }
        statistics
    }

    pub fn record_sent_message(&mut self, kind: SentMessageType) {
        *self.sent_messages.entry(kind).or_default() += 1;
    }

    pub fn record_incoming_operation(&mut self, kind: IncomingOperationType) {
        *self.incoming_operations.entry(kind).or_default() += 1;
    }

    pub fn record_received_message(&mut self, kind: ReceivedMessageType) {
        *self.received_messages.entry(kind).or_default() += 1;
    }

    pub fn record_listener_event(&mut self, kind: ListenerEventType) {
        *self.listener_events.entry(kind).or_default() += 1;
    }

    pub fn record_error(&mut self, kind: ClientErrorType) {
        *self.client_errors.entry(kind).or_default() += 1;
    }

    pub fn sent_messages(&self, kind: SentMessageType) -> u64 {
        self.sent_messages.get(&kind).copied().unwrap_or(0)
    }

    pub fn incoming_operations(&self, kind: IncomingOperationType) -> u64 {
        self.incoming_operations.get(&kind).copied().unwrap_or(0)
    }

    pub fn received_messages(&self, kind: ReceivedMessageType) -> u64 {
        self.received_messages.get(&kind).copied().unwrap_or(0)
    }

    pub fn listener_events(&self, kind: ListenerEventType) -> u64 {
        self.listener_events.get(&kind).copied().unwrap_or(0)
    }

    pub fn errors(&self, kind: ClientErrorType) -> u64 {
        self.client_errors.get(&kind).copied().unwrap_or(0)
    }

    /// All non-zero counters as `("<Group>.<Variant>", value)`
    pub fn non_zero_statistics(&self) -> Vec<(String, u64)> {
        let mut result = Vec::new();
        collect_non_zero(&self.sent_messages, &mut result);
        collect_non_zero(&self.incoming_operations, &mut result);
        collect_non_zero(&self.received_messages, &mut result);
        collect_non_zero(&self.listener_events, &mut result);
        collect_non_zero(&self.client_errors, &mut result);
        result
    }

    /// Add every counter of `other` to this one
    pub fn merge(&mut self, other: &Statistics) {
        merge_into(&mut self.sent_messages, &other.sent_messages);
        merge_into(&mut self.incoming_operations, &other.incoming_operations);
        merge_into(&mut self.received_messages, &other.received_messages);
        merge_into(&mut self.listener_events, &other.listener_events);
        merge_into(&mut self.client_errors, &other.client_errors);
    }

    /// Zero all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn marshal(&self) -> StatisticsState {
        StatisticsState {
            counters: self.non_zero_statistics(),
        }
    }

    fn set_by_name(&mut self, name: &str, value: u64) -> bool {
        let Some((group, variant)) = name.split_once('.') else {
            return false;
        };
        if group == SentMessageType::group() {
            set_counter(&mut self.sent_messages, SentMessageType::from_name(variant), value)
        } else if group == IncomingOperationType::group() {
            set_counter(
                &mut self.incoming_operations,
                IncomingOperationType::from_name(variant),
                value,
            )
        } else if group == ReceivedMessageType::group() {
            set_counter(
                &mut self.received_messages,
                ReceivedMessageType::from_name(variant),
                value,
            )
        } else if group == ListenerEventType::group() {
            set_counter(
                &mut self.listener_events,
                ListenerEventType::from_name(variant),
                value,
            )
        } else if group == ClientErrorType::group() {
            set_counter(&mut self.client_errors, ClientErrorType::from_name(variant), value)
        } else {
            false
        }
    }
}

fn collect_non_zero<K: fmt::Display>(counters: &BTreeMap<K, u64>, out: &mut Vec<(String, u64)>) {
    out.extend(
        counters
            .iter()
            .filter(|(_, value)| **value > 0)
            .map(|(key, value)| (key.to_string(), *value)),
    );
}

fn merge_into<K: Ord + Copy>(target: &mut BTreeMap<K, u64>, source: &BTreeMap<K, u64>) {
    for (key, value) in source {
        *target.entry(*key).or_default() += value;
    }
}

fn set_counter<K: Ord>(counters: &mut BTreeMap<K, u64>, key: Option<K>, value: u64) -> bool {
    match key {
        Some(key) => {
            counters.insert(key, value);
            true
        }
        None => false,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
