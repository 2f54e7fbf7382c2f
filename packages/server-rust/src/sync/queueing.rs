//! Buffer queueing and dequeuing, and the FSIC bookkeeping around them.
//!
//! Queueing computes the directional FSIC diff between the two sides of a
//! transfer session and copies the qualifying store rows into the buffer.
//! Dequeuing runs the fixed sequence of set-oriented merge steps that folds
//! received buffers back into the store. Both ends finish by raising the
//! database max counters from the other side's FSIC.

use std::sync::Arc;

use tracing::debug;

use morango_core::filter::Filter;
use morango_core::fsic::{
    calculate_directional_fsic_diff, calculate_directional_fsic_diff_v2, expand_fsic_for_use,
    Fsic, PartitionCounters,
};
use morango_core::sessions::TransferSession;

use crate::errors::SyncError;
use crate::store::{Database, QueueSelection, StoreBackend};

/// Maximum UNION'd selects a relational backend will tolerate.
pub const SQL_UNION_MAX: usize = 500;
/// FSIC entries per UNION'd select.
pub const QUEUE_CHUNK_SIZE: usize = 200;

/// Expand either FSIC layout into the per-partition form used for diffing.
/// A flat v1 map applies uniformly to every filter partition.
fn expanded(fsic: Fsic, filter: &Filter) -> PartitionCounters {
    match fsic {
        Fsic::V2(raw) => expand_fsic_for_use(&raw, filter),
        Fsic::V1(counters) => filter
            .iter()
            .map(|partition| (partition.clone(), counters.clone()))
            .collect(),
    }
}

/// Select the records the producer must send and copy them into the buffer.
/// Returns the number of records queued.
///
/// # Errors
///
/// Returns [`SyncError::LimitExceeded`] when the FSIC diff is too large to
/// realize as chunked SQL, and [`SyncError::Malformed`] for unparseable
/// session FSICs.
pub fn queue_into_buffer(
    db: &Arc<Database>,
    session: &TransferSession,
    profile: &str,
) -> Result<usize, SyncError> {
    let filter = session.get_filter();
    let client_fsic = Fsic::from_json(&session.client_fsic)?;
    let server_fsic = Fsic::from_json(&session.server_fsic)?;
    let (sender, receiver) = if session.push {
        (client_fsic, server_fsic)
    } else {
        (server_fsic, client_fsic)
    };

    let selection = match (sender, receiver) {
        (Fsic::V1(sender), Fsic::V1(receiver)) => {
            QueueSelection::V1(calculate_directional_fsic_diff(&sender, &receiver))
        }
        (sender, receiver) => QueueSelection::V2(calculate_directional_fsic_diff_v2(
            &expanded(sender, &filter),
            &expanded(receiver, &filter),
        )),
    };

    // identical counters, or the receiving end is ahead: nothing to queue
    if selection.is_empty() {
        return Ok(0);
    }

    let limit = QUEUE_CHUNK_SIZE * SQL_UNION_MAX;
    if selection.len() >= limit {
        return Err(SyncError::LimitExceeded {
            limit,
            actual: selection.len(),
        });
    }

    for partition in &filter {
        db.lock_partition(partition, true);
    }
    let queued = db.queue_into_buffer(session, profile, &selection);
    debug!(transfer_session = %session.id, queued, "queued records into buffer");
    Ok(queued)
}

/// Merge a transfer session's received buffers into the store.
///
/// The step order is load-bearing: reverse fast-forwards are pruned first so
/// the merge-conflict steps only see contested records, and the absorbed
/// rows are deleted before the fast-forward insert sweeps up the remainder.
pub fn dequeue_into_store(db: &Arc<Database>, session: &TransferSession) {
    for partition in &session.get_filter() {
        db.lock_partition(partition, false);
    }

    let ts_id = session.id.as_str();
    db.dequeuing_delete_rmcb_records(ts_id);
    db.dequeuing_delete_buffered_records(ts_id);
    let current = db.current_instance_and_increment();
    db.dequeuing_merge_conflict_buffer(&current, ts_id);
    db.dequeuing_merge_conflict_rmcb(ts_id);
    db.dequeuing_update_rmcs_last_saved_by(&current, ts_id);
    db.dequeuing_delete_mc_rmcb(ts_id);
    db.dequeuing_delete_mc_buffer(ts_id);
    db.dequeuing_insert_remaining_buffer(ts_id);
    db.dequeuing_insert_remaining_rmcb(ts_id);
    db.dequeuing_delete_remaining_rmcb(ts_id);
    db.dequeuing_delete_remaining_buffer(ts_id);
    debug!(transfer_session = %session.id, "dequeued buffers into store");
}

/// This side's FSIC for a filter, in the negotiated layout.
#[must_use]
pub fn calculate_fsic(db: &Arc<Database>, filter: &Filter, use_v2: bool) -> Fsic {
    if use_v2 {
        Fsic::V2(db.calculate_fsic_v2(filter))
    } else {
        Fsic::V1(db.calculate_filter_max_counters(filter))
    }
}

/// Raise the database max counters from the other side's FSIC after a
/// completed transfer, so future FSICs reflect the data just received.
pub fn update_fsics(db: &Arc<Database>, fsic: &Fsic, filter: &Filter) {
    match fsic {
        Fsic::V1(incoming) => {
            let internal = db.calculate_filter_max_counters(filter);
            for (instance, counter) in incoming {
                let known = internal.get(instance).copied().unwrap_or(0);
                if *counter > known {
                    for partition in filter {
                        db.raise_dmc(instance, partition, *counter);
                    }
                }
            }
        }
        Fsic::V2(raw) => {
            for (partition, instances) in expand_fsic_for_use(raw, filter) {
                for (instance, counter) in instances {
                    db.raise_dmc(&instance, &partition, counter);
                }
            }
        }
    }
}

/// Validate a chunk of incoming buffer payloads against the transfer
/// session and insert them, bumping the session's transferred count.
///
/// Checks, per record: the model uuid is the content-address of its routing
/// fields; the partition is inside the session filter; every nested counter
/// row references this session and this record.
///
/// # Errors
///
/// Returns [`SyncError::InvalidBuffer`] naming the first failed check.
pub fn validate_and_create_buffer_data(
    db: &Arc<Database>,
    session: &TransferSession,
    profile: &str,
    payloads: Vec<morango_core::messages::BufferPayload>,
) -> Result<usize, SyncError> {
    use morango_core::records::{compute_namespaced_id, ID_PLACEHOLDER};

    let filter = session.get_filter();
    let mut buffers = Vec::with_capacity(payloads.len());
    let mut rmcbs = Vec::new();
    for mut payload in payloads {
        let partition_template = payload.partition.replace(&payload.model_uuid, ID_PLACEHOLDER);
        let expected = compute_namespaced_id(
            &partition_template,
            &payload.source_id,
            &payload.model_name,
        );
        if expected != payload.model_uuid {
            return Err(SyncError::InvalidBuffer(format!(
                "model_uuid {} does not match computed id {expected}",
                payload.model_uuid
            )));
        }
        if payload.transfer_session_id != session.id {
            return Err(SyncError::InvalidBuffer(
                "record is not associated with this transfer session".into(),
            ));
        }
        if !filter.contains_partition(&payload.partition) {
            return Err(SyncError::InvalidBuffer(format!(
                "partition {} is not contained within the transfer filter",
                payload.partition
            )));
        }
        for rmcb in &payload.rmcb_list {
            if rmcb.transfer_session_id != session.id {
                return Err(SyncError::InvalidBuffer(
                    "counter row is not associated with this transfer session".into(),
                ));
            }
            if rmcb.model_uuid != payload.model_uuid {
                return Err(SyncError::InvalidBuffer(
                    "counter row does not reference its buffer record".into(),
                ));
            }
        }
        // the receiving side is authoritative for the profile
        payload.profile = profile.to_string();
        let (buffer, mut counter_rows) = payload.into_records();
        buffers.push(buffer);
        rmcbs.append(&mut counter_rows);
    }

    let count = buffers.len();
    db.insert_buffers(buffers, rmcbs);
    if let Some(mut fresh) = db.get_transfer_session(&session.id) {
        fresh.records_transferred += i64::try_from(count).unwrap_or(i64::MAX);
        fresh.last_activity_timestamp = crate::store::now_millis();
        db.save_transfer_session(fresh);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceIdentity;
    use morango_core::fsic::InstanceCounters;
    use morango_core::records::StoreRecord;

    fn database() -> Arc<Database> {
        Arc::new(Database::new(InstanceIdentity::default()))
    }

    fn session(filter: &str, push: bool, client_fsic: &str, server_fsic: &str) -> TransferSession {
        TransferSession {
            id: "t".repeat(32),
            filter: filter.to_string(),
            push,
            active: true,
            records_transferred: 0,
            records_total: None,
            bytes_sent: 0,
            bytes_received: 0,
            sync_session_id: "s".repeat(32),
            start_timestamp: 0,
            last_activity_timestamp: 0,
            client_fsic: client_fsic.to_string(),
            server_fsic: server_fsic.to_string(),
            transfer_stage: None,
            transfer_stage_status: None,
        }
    }

    fn store_record(seed: &str, partition: &str, instance: &str, counter: i64) -> StoreRecord {
        StoreRecord {
            id: morango_core::sha2_uuid(&[seed]),
            profile: "testprofile".into(),
            serialized: "{}".into(),
            deleted: false,
            hard_deleted: false,
            last_saved_instance: instance.to_string(),
            last_saved_counter: counter,
            partition: partition.to_string(),
            source_id: seed.to_string(),
            model_name: "person".into(),
            conflicting_serialized_data: String::new(),
            self_ref_fk: String::new(),
            dirty_bit: false,
            deserialization_error: String::new(),
            last_transfer_session_id: None,
        }
    }

    #[test]
    fn queue_selects_minimal_record_set() {
        let db = database();
        let instance = "a".repeat(32);
        let newer = store_record("newer", "p:x", &instance, 5);
        let older = store_record("older", "p:y", &instance, 2);
        for record in [&newer, &older] {
            db.upsert_store_record(record.clone());
            db.upsert_rmc(&record.id, &instance, record.last_saved_counter);
        }

        // client has counter 5, server has 3: only the newer record flows
        let push = session(
            "p",
            true,
            &format!(r#"{{"{instance}": 5}}"#),
            &format!(r#"{{"{instance}": 3}}"#),
        );
        let queued = queue_into_buffer(&db, &push, "testprofile").unwrap();
        assert_eq!(queued, 1);
        assert_eq!(db.buffers_chunk(&push.id, 0, 10)[0].0.model_uuid, newer.id);
    }

    #[test]
    fn queue_nothing_when_receiver_is_current() {
        let db = database();
        let instance = "a".repeat(32);
        let record = store_record("rec", "p:x", &instance, 5);
        db.upsert_store_record(record);

        let push = session(
            "p",
            true,
            &format!(r#"{{"{instance}": 5}}"#),
            &format!(r#"{{"{instance}": 5}}"#),
        );
        assert_eq!(queue_into_buffer(&db, &push, "testprofile").unwrap(), 0);
        assert_eq!(db.count_buffers(&push.id), 0);
    }

    #[test]
    fn queue_direction_follows_push_flag() {
        let db = database();
        let instance = "a".repeat(32);
        let record = store_record("rec", "p:x", &instance, 5);
        db.upsert_store_record(record.clone());
        db.upsert_rmc(&record.id, &instance, 5);

        // pull: the server is the sender, so server-newer data queues
        let pull = session(
            "p",
            false,
            &format!(r#"{{"{instance}": 0}}"#),
            &format!(r#"{{"{instance}": 5}}"#),
        );
        assert_eq!(queue_into_buffer(&db, &pull, "testprofile").unwrap(), 1);
    }

    #[test]
    fn queue_v2_fsics_diff_per_partition() {
        let db = database();
        let instance = "a".repeat(32);
        let in_x = store_record("x", "p:x:1", &instance, 5);
        let in_y = store_record("y", "p:y:1", &instance, 5);
        for record in [&in_x, &in_y] {
            db.upsert_store_record(record.clone());
            db.upsert_rmc(&record.id, &instance, 5);
        }

        // the receiver already covers p:y at counter 9 but p:x only at 1
        let client = format!(r#"{{"super": {{}}, "sub": {{"p": {{"{instance}": 5}}}}}}"#);
        let server = format!(
            r#"{{"super": {{}}, "sub": {{"p:x": {{"{instance}": 1}}, "p:y": {{"{instance}": 9}}}}}}"#
        );
        let push = session("p", true, &client, &server);
        let queued = queue_into_buffer(&db, &push, "testprofile").unwrap();
        assert_eq!(queued, 1);
        assert_eq!(db.buffers_chunk(&push.id, 0, 10)[0].0.model_uuid, in_x.id);
    }

    #[test]
    fn queue_rejects_oversized_fsics() {
        let db = database();
        let mut counters = InstanceCounters::new();
        for i in 0..(QUEUE_CHUNK_SIZE * SQL_UNION_MAX) {
            counters.insert(format!("{i:032}"), 5);
        }
        let push = session(
            "p",
            true,
            &serde_json::to_string(&counters).unwrap(),
            "{}",
        );
        let err = queue_into_buffer(&db, &push, "testprofile").unwrap_err();
        assert!(matches!(err, SyncError::LimitExceeded { .. }));
    }

    #[test]
    fn update_fsics_v1_raises_dmcs_per_partition() {
        let db = database();
        let instance = "a".repeat(32);
        let filter: Filter = "p:x\np:y".into();
        let mut incoming = InstanceCounters::new();
        incoming.insert(instance.clone(), 7);

        update_fsics(&db, &Fsic::V1(incoming), &filter);

        let dmcs = db.all_dmcs();
        assert_eq!(dmcs.len(), 2);
        assert!(dmcs.iter().all(|d| d.counter == 7));

        // a lower incoming counter does not regress anything
        let mut lower = InstanceCounters::new();
        lower.insert(instance, 3);
        update_fsics(&db, &Fsic::V1(lower), &filter);
        assert!(db.all_dmcs().iter().all(|d| d.counter == 7));
    }

    #[test]
    fn update_fsics_v2_raises_per_partition_rows() {
        let db = database();
        let instance = "a".repeat(32);
        let filter: Filter = "p".into();
        let fsic = Fsic::from_json(&format!(
            r#"{{"super": {{}}, "sub": {{"p:x": {{"{instance}": 4}}}}}}"#
        ))
        .unwrap();

        update_fsics(&db, &fsic, &filter);

        let dmcs = db.all_dmcs();
        assert_eq!(dmcs.len(), 1);
        assert_eq!(dmcs[0].partition, "p:x");
        assert_eq!(dmcs[0].counter, 4);
    }

    proptest::proptest! {
        /// A record is queued exactly when its counter exceeds the
        /// receiver's lower bound for its instance.
        #[test]
        fn queue_selects_iff_counter_exceeds_lower_bound(
            counter in 1i64..20,
            receiver_counter in 0i64..20,
        ) {
            let db = database();
            let instance = "a".repeat(32);
            let record = store_record("rec", "p:x", &instance, counter);
            db.upsert_store_record(record.clone());
            db.upsert_rmc(&record.id, &instance, counter);

            let push = session(
                "p",
                true,
                &format!(r#"{{"{instance}": {counter}}}"#),
                &format!(r#"{{"{instance}": {receiver_counter}}}"#),
            );
            let queued = queue_into_buffer(&db, &push, "testprofile").unwrap();
            proptest::prop_assert_eq!(queued, usize::from(counter > receiver_counter));
        }
    }

    #[test]
    fn counter_never_decreases_through_sync_operations() {
        let db = database();
        let instance = "a".repeat(32);
        let record = store_record("rec", "p:x", &instance, 5);
        db.upsert_store_record(record.clone());
        db.upsert_rmc(&record.id, &instance, 5);

        // queue + an empty dequeue leave the rmc untouched
        let push = session("p", true, &format!(r#"{{"{instance}": 5}}"#), "{}");
        queue_into_buffer(&db, &push, "testprofile").unwrap();
        let before = db.get_rmc(&record.id, &instance).unwrap();
        dequeue_into_store(&db, &push);
        assert!(db.get_rmc(&record.id, &instance).unwrap() >= before);
    }
}
