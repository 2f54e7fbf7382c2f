//! The stale-session sweep.
//!
//! Transfer sessions with no activity past a cutoff are emptied and closed;
//! sync sessions close afterwards, but only once they have no active
//! transfer sessions and are themselves past the cutoff.

use std::sync::Arc;

use tracing::info;

use crate::store::{now_millis, Database};

/// Narrowing options for a cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Hours of inactivity after which a session counts as stale.
    pub expiration_hours: i64,
    /// Restrict to these sync session ids, when non-empty.
    pub ids: Vec<String>,
    /// Restrict to transfer sessions whose filter starts with this prefix.
    pub sync_filter: Option<String>,
    /// Restrict by direction. `Some(true)` = pushes only.
    pub push: Option<bool>,
}

impl CleanupOptions {
    #[must_use]
    pub fn with_expiration_hours(hours: i64) -> Self {
        Self {
            expiration_hours: hours,
            ..Self::default()
        }
    }
}

/// Close stale transfer sessions (emptying their buffers) and then any sync
/// sessions left with no active transfers and no recent activity. Returns
/// (transfer sessions closed, sync sessions closed).
pub fn cleanup_syncs(db: &Arc<Database>, options: &CleanupOptions) -> (usize, usize) {
    let cutoff = now_millis() - options.expiration_hours * 60 * 60 * 1000;

    let sync_sessions: Vec<_> = db
        .active_sync_sessions()
        .into_iter()
        .filter(|s| options.ids.is_empty() || options.ids.contains(&s.id))
        .collect();

    let mut transfers_closed = 0;
    for sync_session in &sync_sessions {
        let stale_transfers = db
            .transfer_sessions_for_sync(&sync_session.id, true)
            .into_iter()
            .filter(|t| t.last_activity_timestamp < cutoff)
            .filter(|t| {
                options
                    .sync_filter
                    .as_deref()
                    .is_none_or(|prefix| t.filter.starts_with(prefix))
            })
            .filter(|t| options.push.is_none_or(|push| t.push == push));
        for mut transfer in stale_transfers {
            info!(transfer_session = %transfer.id, "closing stale transfer session");
            db.delete_buffers(&transfer.id);
            transfer.active = false;
            db.save_transfer_session(transfer);
            transfers_closed += 1;
        }
    }

    let mut syncs_closed = 0;
    for mut sync_session in sync_sessions {
        if sync_session.last_activity_timestamp >= cutoff {
            continue;
        }
        if !db
            .transfer_sessions_for_sync(&sync_session.id, true)
            .is_empty()
        {
            continue;
        }
        info!(sync_session = %sync_session.id, "closing stale sync session");
        sync_session.active = false;
        db.save_sync_session(sync_session);
        syncs_closed += 1;
    }

    (transfers_closed, syncs_closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceIdentity;
    use morango_core::records::{BufferRecord, RecordMaxCounterBuffer};
    use morango_core::sessions::{ConnectionKind, SyncSession, TransferSession};

    fn database() -> Arc<Database> {
        Arc::new(Database::new(InstanceIdentity::default()))
    }

    fn sync_session(id: &str, last_activity: i64) -> SyncSession {
        SyncSession {
            id: id.to_string(),
            start_timestamp: 0,
            last_activity_timestamp: last_activity,
            active: true,
            is_server: true,
            client_certificate_id: None,
            server_certificate_id: None,
            profile: "testprofile".into(),
            connection_kind: ConnectionKind::Network,
            connection_path: String::new(),
            client_ip: String::new(),
            server_ip: String::new(),
            client_instance: "{}".into(),
            server_instance: "{}".into(),
            process_id: None,
            extra_fields: "{}".into(),
        }
    }

    fn transfer_session(id: &str, sync_id: &str, last_activity: i64) -> TransferSession {
        TransferSession {
            id: id.to_string(),
            filter: "p".into(),
            push: true,
            active: true,
            records_transferred: 0,
            records_total: None,
            bytes_sent: 0,
            bytes_received: 0,
            sync_session_id: sync_id.to_string(),
            start_timestamp: 0,
            last_activity_timestamp: last_activity,
            client_fsic: "{}".into(),
            server_fsic: "{}".into(),
            transfer_stage: None,
            transfer_stage_status: None,
        }
    }

    fn seed_buffer(db: &Arc<Database>, ts_id: &str) {
        db.insert_buffers(
            vec![BufferRecord {
                model_uuid: "m".repeat(32),
                profile: "testprofile".into(),
                serialized: "{}".into(),
                deleted: false,
                hard_deleted: false,
                last_saved_instance: "i".repeat(32),
                last_saved_counter: 1,
                partition: "p".into(),
                source_id: "s".into(),
                model_name: "person".into(),
                conflicting_serialized_data: String::new(),
                self_ref_fk: String::new(),
                transfer_session_id: ts_id.to_string(),
            }],
            vec![RecordMaxCounterBuffer {
                instance_id: "i".repeat(32),
                counter: 1,
                transfer_session_id: ts_id.to_string(),
                model_uuid: "m".repeat(32),
            }],
        );
    }

    #[test]
    fn stale_transfer_sessions_are_emptied_and_closed() {
        let db = database();
        let old = now_millis() - 7 * 60 * 60 * 1000;
        db.save_sync_session(sync_session("sync-1", old));
        db.save_transfer_session(transfer_session("ts-1", "sync-1", old));
        seed_buffer(&db, "ts-1");

        let (transfers, syncs) =
            cleanup_syncs(&db, &CleanupOptions::with_expiration_hours(6));

        assert_eq!(transfers, 1);
        assert_eq!(syncs, 1);
        assert_eq!(db.count_buffers("ts-1"), 0);
        assert!(!db.get_transfer_session("ts-1").unwrap().active);
        assert!(!db.get_sync_session("sync-1").unwrap().active);
    }

    #[test]
    fn sync_session_stays_open_while_a_transfer_is_active() {
        let db = database();
        let old = now_millis() - 7 * 60 * 60 * 1000;
        db.save_sync_session(sync_session("sync-1", old));
        // one stale transfer, one fresh
        db.save_transfer_session(transfer_session("ts-old", "sync-1", old));
        db.save_transfer_session(transfer_session("ts-new", "sync-1", now_millis()));

        let (transfers, syncs) =
            cleanup_syncs(&db, &CleanupOptions::with_expiration_hours(6));

        assert_eq!(transfers, 1);
        assert_eq!(syncs, 0);
        assert!(db.get_sync_session("sync-1").unwrap().active);
        assert!(db.get_transfer_session("ts-new").unwrap().active);
    }

    #[test]
    fn fresh_sessions_are_untouched() {
        let db = database();
        db.save_sync_session(sync_session("sync-1", now_millis()));
        db.save_transfer_session(transfer_session("ts-1", "sync-1", now_millis()));

        let (transfers, syncs) =
            cleanup_syncs(&db, &CleanupOptions::with_expiration_hours(6));
        assert_eq!((transfers, syncs), (0, 0));
    }

    #[test]
    fn id_and_direction_filters_narrow_the_sweep() {
        let db = database();
        let old = now_millis() - 7 * 60 * 60 * 1000;
        db.save_sync_session(sync_session("sync-1", old));
        db.save_sync_session(sync_session("sync-2", old));
        db.save_transfer_session(transfer_session("ts-1", "sync-1", old));
        let mut pull = transfer_session("ts-2", "sync-2", old);
        pull.push = false;
        db.save_transfer_session(pull);

        // only sync-2, and only pushes: nothing matches the pull transfer
        let options = CleanupOptions {
            expiration_hours: 6,
            ids: vec!["sync-2".into()],
            push: Some(true),
            sync_filter: None,
        };
        let (transfers, _) = cleanup_syncs(&db, &options);
        assert_eq!(transfers, 0);
        assert!(db.get_transfer_session("ts-1").unwrap().active);
    }
}
