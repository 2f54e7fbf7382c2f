//! Sync and transfer session rows, and the staged transfer state machine's
//! vocabulary.
//!
//! A [`SyncSession`] is an authenticated link between two peers. Within it,
//! each [`TransferSession`] moves one filter's worth of records in one
//! direction, advancing through the totally ordered [`TransferStage`]s. A
//! stage never decreases over the life of a transfer session.

use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// The ordered stages of a transfer. Derived `Ord` follows declaration
/// order, which is the canonical stage precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransferStage {
    Initializing,
    Serializing,
    Queuing,
    Transferring,
    Dequeuing,
    Deserializing,
    Cleanup,
}

impl TransferStage {
    /// All stages in precedence order.
    pub const ALL: [TransferStage; 7] = [
        TransferStage::Initializing,
        TransferStage::Serializing,
        TransferStage::Queuing,
        TransferStage::Transferring,
        TransferStage::Dequeuing,
        TransferStage::Deserializing,
        TransferStage::Cleanup,
    ];
}

impl std::fmt::Display for TransferStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStage::Initializing => "initializing",
            TransferStage::Serializing => "serializing",
            TransferStage::Queuing => "queuing",
            TransferStage::Transferring => "transferring",
            TransferStage::Dequeuing => "dequeuing",
            TransferStage::Deserializing => "deserializing",
            TransferStage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Status of the current stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Started,
    Completed,
    Errored,
}

impl TransferStatus {
    /// True for statuses that permit further controller progress.
    #[must_use]
    pub fn is_in_progress(self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Started)
    }

    /// True for terminal statuses.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Errored)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Started => "started",
            TransferStatus::Completed => "completed",
            TransferStatus::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// How two peers are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Network,
    Disk,
}

/// Metadata for an established peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    /// Unix millis.
    pub start_timestamp: i64,
    pub last_activity_timestamp: i64,
    pub active: bool,
    /// Whether this side is acting as the server for the session.
    pub is_server: bool,
    pub client_certificate_id: Option<String>,
    pub server_certificate_id: Option<String>,
    pub profile: String,
    pub connection_kind: ConnectionKind,
    /// Base URL of the server when kind is network.
    pub connection_path: String,
    pub client_ip: String,
    pub server_ip: String,
    /// Serialized instance metadata of each side, for diagnostics.
    pub client_instance: String,
    pub server_instance: String,
    /// OS process currently driving this sync, for resumption arbitration.
    pub process_id: Option<u32>,
    pub extra_fields: String,
}

/// One filter's worth of transfer in one direction, inside a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: String,
    /// Newline-delimited partition prefixes being synced.
    pub filter: String,
    /// True when data flows client -> server.
    pub push: bool,
    pub active: bool,
    pub records_transferred: i64,
    pub records_total: Option<i64>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub sync_session_id: String,
    pub start_timestamp: i64,
    pub last_activity_timestamp: i64,
    /// JSON FSIC from each side (v1 or v2 wire form).
    pub client_fsic: String,
    pub server_fsic: String,
    pub transfer_stage: Option<TransferStage>,
    pub transfer_stage_status: Option<TransferStatus>,
}

impl TransferSession {
    /// Parse the session's filter string.
    #[must_use]
    pub fn get_filter(&self) -> Filter {
        Filter::from(self.filter.as_str())
    }

    /// Advance stage/status. The stage is monotone: an update naming an
    /// earlier stage leaves the current one in place.
    pub fn update_state(
        &mut self,
        stage: Option<TransferStage>,
        stage_status: Option<TransferStatus>,
    ) {
        if let Some(stage) = stage {
            if self.transfer_stage.is_none_or(|current| stage >= current) {
                self.transfer_stage = Some(stage);
            }
        }
        if let Some(status) = stage_status {
            self.transfer_stage_status = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_totally_ordered() {
        let all = TransferStage::ALL;
        for window in all.windows(2) {
            assert!(window[0] < window[1]);
        }
        assert!(TransferStage::Initializing < TransferStage::Cleanup);
        assert!(TransferStage::Transferring > TransferStage::Queuing);
    }

    #[test]
    fn stage_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&TransferStage::Dequeuing).unwrap();
        assert_eq!(json, r#""dequeuing""#);
        let back: TransferStage = serde_json::from_str(r#""serializing""#).unwrap();
        assert_eq!(back, TransferStage::Serializing);
    }

    #[test]
    fn status_classification() {
        assert!(TransferStatus::Pending.is_in_progress());
        assert!(TransferStatus::Started.is_in_progress());
        assert!(TransferStatus::Completed.is_finished());
        assert!(TransferStatus::Errored.is_finished());
    }

    fn session() -> TransferSession {
        TransferSession {
            id: "t".repeat(32),
            filter: "abc:user\nabc:admin".into(),
            push: true,
            active: true,
            records_transferred: 0,
            records_total: None,
            bytes_sent: 0,
            bytes_received: 0,
            sync_session_id: "s".repeat(32),
            start_timestamp: 0,
            last_activity_timestamp: 0,
            client_fsic: "{}".into(),
            server_fsic: "{}".into(),
            transfer_stage: None,
            transfer_stage_status: None,
        }
    }

    #[test]
    fn filter_parses_from_session() {
        let filter = session().get_filter();
        assert_eq!(filter.partitions(), ["abc:user", "abc:admin"]);
    }

    #[test]
    fn stage_updates_are_monotone() {
        let mut ts = session();
        ts.update_state(Some(TransferStage::Queuing), Some(TransferStatus::Started));
        assert_eq!(ts.transfer_stage, Some(TransferStage::Queuing));

        // attempting to move backwards leaves the stage in place
        ts.update_state(Some(TransferStage::Initializing), None);
        assert_eq!(ts.transfer_stage, Some(TransferStage::Queuing));

        ts.update_state(Some(TransferStage::Cleanup), Some(TransferStatus::Completed));
        assert_eq!(ts.transfer_stage, Some(TransferStage::Cleanup));
        assert_eq!(ts.transfer_stage_status, Some(TransferStatus::Completed));
    }
}
