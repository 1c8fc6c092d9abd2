//! Desired registrations and their digest
//!
//! The manager keeps the set of objects the application wants to be
//! registered and summarizes it as a count plus a SHA-256 digest. The client
//! is in sync with the server when the server's last reported summary equals
//! the local one; until then the RegSyncHeartbeat task keeps asking for it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::protocol::{RegistrationStatus, RegistrationSubtree, RegistrationSummary};
use crate::statistics::{ClientErrorType, Statistics};
use crate::types::{ObjectId, RegistrationOp};

/// Marshalled registration manager state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationManagerState {
    pub registrations: Vec<ObjectId>,
    pub last_known_server_summary: Option<RegistrationSummary>,
}

pub trait RegistrationManager {
    /// Apply `op` to every object; returns the objects whose desired state changed
    fn perform_operations(&mut self, objects: &[ObjectId], op: RegistrationOp) -> Vec<ObjectId>;

    fn is_state_in_sync_with_server(&self) -> bool;

    fn inform_server_summary(&mut self, summary: &RegistrationSummary);

    /// Summary of the local desired state
    fn registration_summary(&self) -> RegistrationSummary;

    /// Objects whose digest starts with the first `prefix_bits` bits of `prefix`
    fn get_registrations(&self, prefix: &[u8], prefix_bits: u32) -> RegistrationSubtree;

    /// Reconcile server statuses with local intent; one flag per status, true
    /// when the server outcome agrees with what the application wants
    fn handle_registration_status(
        &mut self,
        statuses: &[RegistrationStatus],
        statistics: &mut Statistics,
    ) -> Vec<bool>;

    /// Drop every desired registration, returning them
    fn remove_all(&mut self) -> Vec<ObjectId>;

    fn marshal(&self) -> RegistrationManagerState;
}

// ----------------------------------------------------------------------------
// Digest Registration Manager
// ----------------------------------------------------------------------------

fn object_digest(object_id: &ObjectId) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(object_id.source.to_be_bytes());
    hasher.update(&object_id.name);
    hasher.finalize().to_vec()
}

fn prefix_matches(digest: &[u8], prefix: &[u8], prefix_bits: u32) -> bool {
    let bits = prefix_bits as usize;
    if bits > prefix.len() * 8 || bits > digest.len() * 8 {
        return false;
    }
    let full_bytes = bits / 8;
    if digest[..full_bytes] != prefix[..full_bytes] {
        return false;
    }
    let remaining = bits % 8;
    if remaining == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - remaining);
    digest[full_bytes] & mask == prefix[full_bytes] & mask
}

/// Default [`RegistrationManager`] keyed by per-object SHA-256 digests
#[derive(Debug, Clone, Default)]
pub struct DigestRegistrationManager {
    /// Per-object digest to object; ordering by digest makes the set digest canonical
    desired: BTreeMap<Vec<u8>, ObjectId>,
    last_known_server_summary: Option<RegistrationSummary>,
}

impl DigestRegistrationManager {
    pub fn new(saved: Option<RegistrationManagerState>) -> Self {
        let mut manager = Self::default();
        if let Some(state) = saved {
            for object_id in state.registrations {
                manager.desired.insert(object_digest(&object_id), object_id);
            }
            manager.last_known_server_summary = state.last_known_server_summary;
        }
        manager
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.desired.contains_key(&object_digest(object_id))
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

impl RegistrationManager for DigestRegistrationManager {
    fn perform_operations(&mut self, objects: &[ObjectId], op: RegistrationOp) -> Vec<ObjectId> {
        let mut changed = Vec::new();
        for object_id in objects {
            let digest = object_digest(object_id);
            let did_change = match op {
                RegistrationOp::Register => self.desired.insert(digest, object_id.clone()).is_none(),
                RegistrationOp::Unregister => self.desired.remove(&digest).is_some(),
            };
            if did_change && !changed.contains(object_id) {
                changed.push(object_id.clone());
            }
        }
        debug!("{:?} of {} objects changed {} entries", op, objects.len(), changed.len());
        changed
    }

    fn is_state_in_sync_with_server(&self) -> bool {
        self.last_known_server_summary.as_ref() == Some(&self.registration_summary())
    }

    fn inform_server_summary(&mut self, summary: &RegistrationSummary) {
        self.last_known_server_summary = Some(summary.clone());
    }

    fn registration_summary(&self) -> RegistrationSummary {
        let mut hasher = Sha256::new();
        for digest in self.desired.keys() {
            hasher.update(digest);
        }
        RegistrationSummary {
            num_registrations: self.desired.len() as u32,
            registration_digest: hasher.finalize().to_vec(),
        }
    }

    fn get_registrations(&self, prefix: &[u8], prefix_bits: u32) -> RegistrationSubtree {
        RegistrationSubtree {
            registered_objects: self
                .desired
                .iter()
                .filter(|(digest, _)| prefix_matches(digest, prefix, prefix_bits))
                .map(|(_, object_id)| object_id.clone())
                .collect(),
        }
    }

    fn handle_registration_status(
        &mut self,
        statuses: &[RegistrationStatus],
        statistics: &mut Statistics,
    ) -> Vec<bool> {
        statuses
            .iter()
            .map(|status| {
                let object_id = &status.registration.object_id;
                if status.status.is_success() {
                    let is_register = status.registration.op == RegistrationOp::Register;
                    if is_register != self.contains(object_id) {
                        info!("Registration discrepancy for {}", object_id);
                        statistics.record_error(ClientErrorType::RegistrationDiscrepancy);
                        return false;
                    }
                    true
                } else {
                    self.desired.remove(&object_digest(object_id));
                    false
                }
            })
            .collect()
    }

    fn remove_all(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.desired).into_values().collect()
    }

    fn marshal(&self) -> RegistrationManagerState {
        RegistrationManagerState {
            registrations: self.desired.values().cloned().collect(),
            last_known_server_summary: self.last_known_server_summary.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{Registration, Status, StatusCode};

    fn status(object_id: &ObjectId, op: RegistrationOp, status: Status) -> RegistrationStatus {
        RegistrationStatus {
            registration: Registration {
                object_id: object_id.clone(),
                op,
            },
            status,
        }
    }

    #[test]
    fn test_only_changes_are_returned() {
        let mut manager = DigestRegistrationManager::new(None);
        let a = ObjectId::new(4, "a");
        let b = ObjectId::new(4, "b");

        let changed = manager.perform_operations(&[a.clone(), b.clone()], RegistrationOp::Register);
        assert_eq!(changed, vec![a.clone(), b.clone()]);
        assert!(manager
            .perform_operations(&[a.clone()], RegistrationOp::Register)
            .is_empty());
        assert_eq!(
            manager.perform_operations(&[a.clone(), ObjectId::new(4, "c")], RegistrationOp::Unregister),
            vec![a]
        );
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_summary_is_order_independent() {
        let a = ObjectId::new(4, "a");
        let b = ObjectId::new(5, "b");
        let mut first = DigestRegistrationManager::new(None);
        first.perform_operations(&[a.clone(), b.clone()], RegistrationOp::Register);
        let mut second = DigestRegistrationManager::new(None);
        second.perform_operations(&[b, a], RegistrationOp::Register);

        assert_eq!(first.registration_summary(), second.registration_summary());
        assert_eq!(first.registration_summary().num_registrations, 2);
    }

    #[test]
    fn test_sync_tracks_server_summary() {
        let mut manager = DigestRegistrationManager::new(None);
        assert!(!manager.is_state_in_sync_with_server());

        let summary = manager.registration_summary();
        manager.inform_server_summary(&summary);
        assert!(manager.is_state_in_sync_with_server());

        manager.perform_operations(&[ObjectId::new(4, "a")], RegistrationOp::Register);
        assert!(!manager.is_state_in_sync_with_server());
    }

    #[test]
    fn test_prefix_selection() {
        let mut manager = DigestRegistrationManager::new(None);
        let objects: Vec<ObjectId> = (0..32).map(|i| ObjectId::new(4, format!("obj-{}", i))).collect();
        manager.perform_operations(&objects, RegistrationOp::Register);

        assert_eq!(manager.get_registrations(&[], 0).registered_objects.len(), 32);
        let zero = manager.get_registrations(&[0x00], 1).registered_objects.len();
        let one = manager.get_registrations(&[0x80], 1).registered_objects.len();
        assert_eq!(zero + one, 32);
        assert!(manager.get_registrations(&[0x00], 9).registered_objects.is_empty());
    }

    #[test]
    fn test_registration_status_reconciliation() {
        let mut manager = DigestRegistrationManager::new(None);
        let mut stats = Statistics::new();
        let a = ObjectId::new(4, "a");
        let b = ObjectId::new(4, "b");
        manager.perform_operations(&[a.clone(), b.clone()], RegistrationOp::Register);

        let results = manager.handle_registration_status(
            &[
                status(&a, RegistrationOp::Register, Status::success()),
                status(&b, RegistrationOp::Unregister, Status::success()),
                status(&b, RegistrationOp::Register, Status::failure(StatusCode::PermanentFailure, "no")),
            ],
            &mut stats,
        );

        assert_eq!(results, vec![true, false, false]);
        assert_eq!(stats.errors(ClientErrorType::RegistrationDiscrepancy), 1);
        assert!(manager.contains(&a));
        assert!(!manager.contains(&b));
    }

    #[test]
    fn test_remove_all_and_restore() {
        let mut manager = DigestRegistrationManager::new(None);
        manager.perform_operations(&[ObjectId::new(4, "a")], RegistrationOp::Register);
        let restored = DigestRegistrationManager::new(Some(manager.marshal()));
        assert_eq!(restored.registration_summary(), manager.registration_summary());

        assert_eq!(manager.remove_all(), vec![ObjectId::new(4, "a")]);
        assert!(manager.is_empty());
    }
}
