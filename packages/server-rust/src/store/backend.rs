//! The set-oriented storage primitives behind queueing and dequeuing.
//!
//! A relational backend realizes these as bulk `INSERT ... SELECT` /
//! join-`DELETE` statements; the in-memory [`Database`](super::Database)
//! realizes them as table scans under one lock. Either way, each primitive
//! is one atomic set operation, and [`dequeue`](crate::sync::queueing)
//! composes them in a fixed order so later steps never observe rows that an
//! earlier step should have consumed.

use morango_core::fsic::{InstanceCounters, PartitionCounters};
use morango_core::instance::InstanceId;
use morango_core::sessions::TransferSession;

use crate::store::app::AppRecord;

/// The FSIC diff driving buffer selection, in whichever layout was
/// negotiated for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSelection {
    /// `{instance -> lower bound counter}` applied across the whole filter.
    V1(InstanceCounters),
    /// Per-partition lower bounds; a record matches an entry when its
    /// partition starts with the entry's partition.
    V2(PartitionCounters),
}

impl QueueSelection {
    /// Number of (instance, counter) entries, for request-size limits.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            QueueSelection::V1(counters) => counters.len(),
            QueueSelection::V2(partitions) => partitions.values().map(InstanceCounters::len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage primitives the sync engine requires of its backend.
///
/// The dequeuing methods mirror the eight-step buffer merge: the reverse
/// fast-forward prune (steps 1-2), the merge-conflict absorption (3-6), the
/// fast-forward insert (7), and the final sweep (8). They only make sense
/// when invoked in that order within one logical transaction.
pub trait StoreBackend: Send + Sync {
    /// Copy every store row matching the selection, filter, and profile into
    /// the buffer, along with its record max counters. Returns the number of
    /// records queued.
    fn queue_into_buffer(
        &self,
        session: &TransferSession,
        profile: &str,
        selection: &QueueSelection,
    ) -> usize;

    /// Delete RMCBs for records whose store-side vector clock already
    /// dominates the buffered `(last_saved_instance, last_saved_counter)`.
    fn dequeuing_delete_rmcb_records(&self, transfer_session_id: &str);

    /// Delete the buffer rows so dominated.
    fn dequeuing_delete_buffered_records(&self, transfer_session_id: &str);

    /// Merge conflicting buffer payloads into the store: keep the local
    /// payload (cleared on hard delete), prepend the incoming payload onto
    /// the conflict log, OR the deleted flags, stamp the current instance,
    /// and mark the row dirty.
    fn dequeuing_merge_conflict_buffer(&self, current: &InstanceId, transfer_session_id: &str);

    /// Raise existing store RMC counters to any higher buffered counter for
    /// the same instance, on merge-conflicting records.
    fn dequeuing_merge_conflict_rmcb(&self, transfer_session_id: &str);

    /// Stamp the current instance's RMC entry on all merge-conflicting
    /// records.
    fn dequeuing_update_rmcs_last_saved_by(&self, current: &InstanceId, transfer_session_id: &str);

    /// Drop RMCBs absorbed by the merge-conflict steps.
    fn dequeuing_delete_mc_rmcb(&self, transfer_session_id: &str);

    /// Drop buffer rows absorbed by the merge-conflict steps.
    fn dequeuing_delete_mc_buffer(&self, transfer_session_id: &str);

    /// Fast-forward: upsert every remaining buffer row into the store.
    fn dequeuing_insert_remaining_buffer(&self, transfer_session_id: &str);

    /// Fast-forward: upsert every remaining RMCB into the record max
    /// counters.
    fn dequeuing_insert_remaining_rmcb(&self, transfer_session_id: &str);

    /// Final sweep of this session's RMCBs.
    fn dequeuing_delete_remaining_rmcb(&self, transfer_session_id: &str);

    /// Final sweep of this session's buffers.
    fn dequeuing_delete_remaining_buffer(&self, transfer_session_id: &str);

    /// Bulk-upsert app rows produced by a deserialization pass. Callers may
    /// chunk by [`max_variable_number`](Self::max_variable_number).
    fn bulk_insert_app_records(&self, records: Vec<AppRecord>);

    /// The backend's bound on bind variables per statement (SQLite's
    /// `MAX_VARIABLE_NUMBER` compile option). Unbounded backends report
    /// `usize::MAX`.
    fn max_variable_number(&self) -> usize {
        usize::MAX
    }

    /// Advisory lock over all partitions. No-op for backends whose
    /// transaction isolation already serializes writers.
    fn lock_all_partitions(&self, shared: bool);

    /// Advisory lock over one partition prefix. Implies a shared
    /// all-partitions lock so partition-scoped and whole-database syncs
    /// exclude each other correctly.
    fn lock_partition(&self, partition: &str, shared: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_len_counts_instances() {
        let mut v1 = InstanceCounters::new();
        v1.insert("a".into(), 1);
        v1.insert("b".into(), 2);
        assert_eq!(QueueSelection::V1(v1).len(), 2);

        let mut inner = InstanceCounters::new();
        inner.insert("a".into(), 1);
        let mut v2 = PartitionCounters::new();
        v2.insert("p".into(), inner.clone());
        v2.insert("q".into(), inner);
        let selection = QueueSelection::V2(v2);
        assert_eq!(selection.len(), 2);
        assert!(!selection.is_empty());
    }

    #[test]
    fn empty_selection() {
        assert!(QueueSelection::V1(InstanceCounters::new()).is_empty());
        assert!(QueueSelection::V2(PartitionCounters::new()).is_empty());
    }
}
