//! The `GET morangoinfo/` body.

use serde::{Deserialize, Serialize};

/// Instance metadata and negotiated capabilities advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorangoInfo {
    /// The server's current instance id.
    pub instance_id: String,
    /// Proquint-encoded hash of the instance id, for pairing displays.
    pub instance_hash: String,
    pub capabilities: Vec<String>,
    /// Host-application extras, opaque to the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}
