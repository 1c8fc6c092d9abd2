//! Application callbacks
//!
//! All methods are invoked on the client's internal thread and must not
//! block. The listener never receives the client itself: applications that
//! need to react (acknowledge, re-register) do so through their runtime
//! handle, which queues the call back onto the internal thread.

use crate::types::{AckHandle, ErrorInfo, Invalidation, ObjectId, RegistrationState};

pub trait InvalidationListener {
    /// The client holds a session token and accepts registrations
    fn ready(&mut self);

    /// `invalidation` changed; acknowledge with `ack_handle` once processed
    fn invalidate(&mut self, invalidation: &Invalidation, ack_handle: AckHandle);

    /// `object_id` changed but the server does not know to which version
    fn invalidate_unknown_version(&mut self, object_id: &ObjectId, ack_handle: AckHandle);

    /// Every object may have changed
    fn invalidate_all(&mut self, ack_handle: AckHandle);

    fn inform_registration_status(&mut self, object_id: &ObjectId, state: RegistrationState);

    fn inform_registration_failure(&mut self, object_id: &ObjectId, is_transient: bool, message: &str);

    /// Re-register every object whose digest starts with the first
    /// `prefix_len` bits of `prefix`; an empty prefix means all objects
    fn reissue_registrations(&mut self, prefix: &[u8], prefix_len: u32);

    fn inform_error(&mut self, error: &ErrorInfo);
}

impl<L: InvalidationListener + ?Sized> InvalidationListener for Box<L> {
    fn ready(&mut self) {
        (**self).ready()
    }

    fn invalidate(&mut self, invalidation: &Invalidation, ack_handle: AckHandle) {
        (**self).invalidate(invalidation, ack_handle)
    }

    fn invalidate_unknown_version(&mut self, object_id: &ObjectId, ack_handle: AckHandle) {
        (**self).invalidate_unknown_version(object_id, ack_handle)
    }

    fn invalidate_all(&mut self, ack_handle: AckHandle) {
        (**self).invalidate_all(ack_handle)
    }

    fn inform_registration_status(&mut self, object_id: &ObjectId, state: RegistrationState) {
        (**self).inform_registration_status(object_id, state)
    }

    fn inform_registration_failure(&mut self, object_id: &ObjectId, is_transient: bool, message: &str) {
        (**self).inform_registration_failure(object_id, is_transient, message)
    }

    fn reissue_registrations(&mut self, prefix: &[u8], prefix_len: u32) {
        (**self).reissue_registrations(prefix, prefix_len)
    }

    fn inform_error(&mut self, error: &ErrorInfo) {
        (**self).inform_error(error)
    }
}
