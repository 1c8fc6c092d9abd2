//! Listener callbacks delivered to the application as a stream

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use ticl_core::{AckHandle, ErrorInfo, Invalidation, InvalidationListener, ObjectId, RegistrationState};

/// One listener callback, as seen by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AppEvent {
    /// The client holds a token and accepts registrations
    Ready,
    Invalidate {
        invalidation: Invalidation,
        ack_handle: AckHandle,
    },
    InvalidateUnknownVersion {
        object_id: ObjectId,
        ack_handle: AckHandle,
    },
    InvalidateAll {
        ack_handle: AckHandle,
    },
    RegistrationStatus {
        object_id: ObjectId,
        state: RegistrationState,
    },
    RegistrationFailure {
        object_id: ObjectId,
        is_transient: bool,
        message: String,
    },
    /// Re-issue every registration whose digest matches the prefix
    ReissueRegistrations {
        prefix: Vec<u8>,
        prefix_len: u32,
    },
    Error(ErrorInfo),
}

impl AppEvent {
    /// Handle to acknowledge, for the invalidation events
    pub fn ack_handle(&self) -> Option<&AckHandle> {
        match self {
            AppEvent::Invalidate { ack_handle, .. }
            | AppEvent::InvalidateUnknownVersion { ack_handle, .. }
            | AppEvent::InvalidateAll { ack_handle } => Some(ack_handle),
            _ => None,
        }
    }
}

/// Listener that forwards every callback over an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { sender }
    }

    fn emit(&self, event: AppEvent) {
        if self.sender.send(event).is_err() {
            debug!("Application event receiver dropped");
        }
    }
}

impl InvalidationListener for ChannelListener {
    fn ready(&mut self) {
        self.emit(AppEvent::Ready);
    }

    fn invalidate(&mut self, invalidation: &Invalidation, ack_handle: AckHandle) {
        self.emit(AppEvent::Invalidate {
            invalidation: invalidation.clone(),
            ack_handle,
        });
    }

    fn invalidate_unknown_version(&mut self, object_id: &ObjectId, ack_handle: AckHandle) {
        self.emit(AppEvent::InvalidateUnknownVersion {
            object_id: object_id.clone(),
            ack_handle,
        });
    }

    fn invalidate_all(&mut self, ack_handle: AckHandle) {
        self.emit(AppEvent::InvalidateAll { ack_handle });
    }

    fn inform_registration_status(&mut self, object_id: &ObjectId, state: RegistrationState) {
        self.emit(AppEvent::RegistrationStatus {
            object_id: object_id.clone(),
            state,
        });
    }

    fn inform_registration_failure(&mut self, object_id: &ObjectId, is_transient: bool, message: &str) {
        self.emit(AppEvent::RegistrationFailure {
            object_id: object_id.clone(),
            is_transient,
            message: message.to_string(),
        });
    }

    fn reissue_registrations(&mut self, prefix: &[u8], prefix_len: u32) {
        self.emit(AppEvent::ReissueRegistrations {
            prefix: prefix.to_vec(),
            prefix_len,
        });
    }

    fn inform_error(&mut self, error: &ErrorInfo) {
        self.emit(AppEvent::Error(error.clone()));
    }
}
