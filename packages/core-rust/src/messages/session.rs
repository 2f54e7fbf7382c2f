//! Sync-session and transfer-session request/response bodies.

use serde::{Deserialize, Serialize};

use crate::sessions::{TransferSession, TransferStage, TransferStatus};

/// Body of `POST syncsessions/`. The client proves certificate ownership by
/// signing `"{nonce}:{id}"` with its leaf certificate's private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSyncSessionRequest {
    /// Client-chosen session id.
    pub id: String,
    pub server_certificate_id: String,
    pub client_certificate_id: String,
    pub profile: String,
    /// JSON-encoded certificate chain for the client certificate.
    pub certificate_chain: String,
    pub connection_path: String,
    /// Serialized client instance metadata.
    pub instance: String,
    pub nonce: String,
    /// Signature over `"{nonce}:{id}"` by the client certificate.
    pub signature: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub server_ip: String,
}

/// Body of the `POST syncsessions/` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSessionResponse {
    pub id: String,
    /// Server's counter-signature over the same `"{nonce}:{id}"` message.
    pub signature: String,
    /// Serialized server instance metadata.
    pub server_instance: String,
}

/// Body of `POST transfersessions/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferSessionRequest {
    pub id: String,
    /// Newline-delimited partition prefixes.
    pub filter: String,
    pub push: bool,
    pub sync_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_fsic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_total: Option<i64>,
}

/// Body of `PATCH transfersessions/{id}`: every field optional, present
/// fields are applied. Setting `transfer_stage` asks the server to proceed
/// to that stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTransferSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_stage: Option<TransferStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_transferred: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_fsic: Option<String>,
}

/// Transfer-session state as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSessionResponse {
    pub id: String,
    pub filter: String,
    pub push: bool,
    pub active: bool,
    pub records_transferred: i64,
    #[serde(default)]
    pub records_total: Option<i64>,
    pub sync_session_id: String,
    #[serde(default)]
    pub client_fsic: String,
    #[serde(default)]
    pub server_fsic: String,
    #[serde(default)]
    pub transfer_stage: Option<TransferStage>,
    #[serde(default)]
    pub transfer_stage_status: Option<TransferStatus>,
}

impl From<&TransferSession> for TransferSessionResponse {
    fn from(session: &TransferSession) -> Self {
        Self {
            id: session.id.clone(),
            filter: session.filter.clone(),
            push: session.push,
            active: session.active,
            records_transferred: session.records_transferred,
            records_total: session.records_total,
            sync_session_id: session.sync_session_id.clone(),
            client_fsic: session.client_fsic.clone(),
            server_fsic: session.server_fsic.clone(),
            transfer_stage: session.transfer_stage,
            transfer_stage_status: session.transfer_stage_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_omits_absent_fields() {
        let update = UpdateTransferSessionRequest {
            transfer_stage: Some(TransferStage::Queuing),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["transfer_stage"], "queuing");
        assert!(json.get("records_total").is_none());
    }

    #[test]
    fn create_transfer_request_roundtrip() {
        let req = CreateTransferSessionRequest {
            id: "t".repeat(32),
            filter: "abc".into(),
            push: true,
            sync_session_id: "s".repeat(32),
            client_fsic: Some(r#"{"i": 4}"#.into()),
            records_total: Some(10),
        };
        let text = serde_json::to_string(&req).unwrap();
        let back: CreateTransferSessionRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn transfer_response_reflects_session_fields() {
        let session = TransferSession {
            id: "t".repeat(32),
            filter: "abc".into(),
            push: false,
            active: true,
            records_transferred: 2,
            records_total: Some(5),
            bytes_sent: 0,
            bytes_received: 0,
            sync_session_id: "s".repeat(32),
            start_timestamp: 0,
            last_activity_timestamp: 0,
            client_fsic: "{}".into(),
            server_fsic: r#"{"i": 9}"#.into(),
            transfer_stage: Some(TransferStage::Transferring),
            transfer_stage_status: Some(TransferStatus::Started),
        };
        let response = TransferSessionResponse::from(&session);
        assert_eq!(response.records_transferred, 2);
        assert_eq!(response.transfer_stage, Some(TransferStage::Transferring));
        assert_eq!(response.server_fsic, session.server_fsic);
    }
}
