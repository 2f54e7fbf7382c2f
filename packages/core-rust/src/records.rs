//! Persisted record rows: the store, its vector-clock counters, and the
//! transfer-time buffer mirrors.
//!
//! The store is the canonical replicated dataset. Each row holds an opaque
//! JSON payload plus the metadata needed to route, scope, and merge it. The
//! buffer tables mirror store rows for the duration of one transfer session.

use serde::{Deserialize, Serialize};

use crate::uuids::sha2_uuid;

/// Placeholder that app models may embed in partition templates in place of
/// their own id, resolved once the content-addressed id is known.
pub const ID_PLACEHOLDER: &str = "${id}";

/// Compute a store record's content-addressed id.
#[must_use]
pub fn compute_namespaced_id(partition: &str, source_id: &str, model_name: &str) -> String {
    sha2_uuid(&[partition, source_id, model_name])
}

/// The canonical replicated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// `sha2_uuid(partition, source_id, model_name)`.
    pub id: String,
    pub profile: String,
    /// JSON object of app-level fields; `"{}"` after a hard delete.
    pub serialized: String,
    pub deleted: bool,
    /// Tombstone that also erases payload, propagated to referrers.
    pub hard_deleted: bool,
    /// Instance and counter stamped at the last serialization or merge.
    pub last_saved_instance: String,
    pub last_saved_counter: i64,
    pub partition: String,
    pub source_id: String,
    pub model_name: String,
    /// Newline-joined payloads that lost merge conflicts, newest first.
    pub conflicting_serialized_data: String,
    /// Id of the parent row when the app model has a self-referential FK.
    #[serde(rename = "_self_ref_fk")]
    pub self_ref_fk: String,
    /// Set when the row needs deserialization into the app layer.
    pub dirty_bit: bool,
    /// Human-readable validation failure from the last deserialization try.
    pub deserialization_error: String,
    /// The transfer session that last wrote this row, if any.
    pub last_transfer_session_id: Option<String>,
}

impl StoreRecord {
    /// Verify the id against the content-address of the routing fields.
    #[must_use]
    pub fn id_matches_content(&self) -> bool {
        // Tree-structured models embed their own id in the partition; undo
        // that before recomputing the hash.
        let partition = self.partition.replace(&self.id, ID_PLACEHOLDER);
        compute_namespaced_id(&partition, &self.source_id, &self.model_name) == self.id
    }
}

/// One vector-clock entry: the highest counter this record has been saved at
/// by the given instance. Unique on (`store_id`, `instance_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMaxCounter {
    pub store_id: String,
    pub instance_id: String,
    pub counter: i64,
}

/// Transit form of a store row, scoped to one transfer session.
/// Unique on (`transfer_session_id`, `model_uuid`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub model_uuid: String,
    pub profile: String,
    pub serialized: String,
    pub deleted: bool,
    pub hard_deleted: bool,
    pub last_saved_instance: String,
    pub last_saved_counter: i64,
    pub partition: String,
    pub source_id: String,
    pub model_name: String,
    pub conflicting_serialized_data: String,
    #[serde(rename = "_self_ref_fk")]
    pub self_ref_fk: String,
    pub transfer_session_id: String,
}

/// Transit form of a [`RecordMaxCounter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMaxCounterBuffer {
    pub instance_id: String,
    pub counter: i64,
    pub transfer_session_id: String,
    pub model_uuid: String,
}

/// Per (instance, partition prefix): the highest counter this database holds
/// for any record of that instance in that partition. The source of truth
/// for building FSICs. Unique on (`instance_id`, `partition`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMaxCounter {
    pub instance_id: String,
    pub partition: String,
    pub counter: i64,
}

/// A single-use handshake nonce minted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    pub id: String,
    /// Unix millis at mint time; nonces expire after [`NONCE_TTL_MS`].
    pub timestamp: i64,
    pub ip: String,
}

/// How long a nonce stays valid.
pub const NONCE_TTL_MS: i64 = 60_000;

impl Nonce {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        let age = now_ms - self.timestamp;
        !(0 < age && age < NONCE_TTL_MS)
    }
}
