//! Buffer chunk payloads for `POST`/`GET buffers/`.

use serde::{Deserialize, Serialize};

use crate::records::{BufferRecord, RecordMaxCounterBuffer};

/// One record-max-counter entry nested inside a buffer payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmcbPayload {
    pub instance_id: String,
    pub counter: i64,
    /// Transfer session id; named `transfer_session` on the wire.
    #[serde(rename = "transfer_session")]
    pub transfer_session_id: String,
    pub model_uuid: String,
}

impl From<&RecordMaxCounterBuffer> for RmcbPayload {
    fn from(rmcb: &RecordMaxCounterBuffer) -> Self {
        Self {
            instance_id: rmcb.instance_id.clone(),
            counter: rmcb.counter,
            transfer_session_id: rmcb.transfer_session_id.clone(),
            model_uuid: rmcb.model_uuid.clone(),
        }
    }
}

impl From<RmcbPayload> for RecordMaxCounterBuffer {
    fn from(payload: RmcbPayload) -> Self {
        Self {
            instance_id: payload.instance_id,
            counter: payload.counter,
            transfer_session_id: payload.transfer_session_id,
            model_uuid: payload.model_uuid,
        }
    }
}

/// One store row in transit, with its vector-clock entries nested inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPayload {
    pub profile: String,
    pub serialized: String,
    pub deleted: bool,
    pub hard_deleted: bool,
    pub last_saved_instance: String,
    pub last_saved_counter: i64,
    pub partition: String,
    pub source_id: String,
    pub model_name: String,
    pub model_uuid: String,
    pub conflicting_serialized_data: String,
    #[serde(rename = "_self_ref_fk", default)]
    pub self_ref_fk: String,
    #[serde(rename = "transfer_session")]
    pub transfer_session_id: String,
    pub rmcb_list: Vec<RmcbPayload>,
}

impl BufferPayload {
    /// Assemble a wire payload from a buffer row and its counter rows.
    #[must_use]
    pub fn from_records(buffer: &BufferRecord, rmcbs: &[RecordMaxCounterBuffer]) -> Self {
        Self {
            profile: buffer.profile.clone(),
            serialized: buffer.serialized.clone(),
            deleted: buffer.deleted,
            hard_deleted: buffer.hard_deleted,
            last_saved_instance: buffer.last_saved_instance.clone(),
            last_saved_counter: buffer.last_saved_counter,
            partition: buffer.partition.clone(),
            source_id: buffer.source_id.clone(),
            model_name: buffer.model_name.clone(),
            model_uuid: buffer.model_uuid.clone(),
            conflicting_serialized_data: buffer.conflicting_serialized_data.clone(),
            self_ref_fk: buffer.self_ref_fk.clone(),
            transfer_session_id: buffer.transfer_session_id.clone(),
            rmcb_list: rmcbs.iter().map(RmcbPayload::from).collect(),
        }
    }

    /// Split the payload back into its buffer row and counter rows.
    #[must_use]
    pub fn into_records(self) -> (BufferRecord, Vec<RecordMaxCounterBuffer>) {
        let rmcbs = self
            .rmcb_list
            .into_iter()
            .map(RecordMaxCounterBuffer::from)
            .collect();
        let buffer = BufferRecord {
            model_uuid: self.model_uuid,
            profile: self.profile,
            serialized: self.serialized,
            deleted: self.deleted,
            hard_deleted: self.hard_deleted,
            last_saved_instance: self.last_saved_instance,
            last_saved_counter: self.last_saved_counter,
            partition: self.partition,
            source_id: self.source_id,
            model_name: self.model_name,
            conflicting_serialized_data: self.conflicting_serialized_data,
            self_ref_fk: self.self_ref_fk,
            transfer_session_id: self.transfer_session_id,
        };
        (buffer, rmcbs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> BufferPayload {
        BufferPayload {
            profile: "testprofile".into(),
            serialized: r#"{"name": "x"}"#.into(),
            deleted: false,
            hard_deleted: false,
            last_saved_instance: "i".repeat(32),
            last_saved_counter: 3,
            partition: "abc:user".into(),
            source_id: "s1".into(),
            model_name: "person".into(),
            model_uuid: "m".repeat(32),
            conflicting_serialized_data: String::new(),
            self_ref_fk: String::new(),
            transfer_session_id: "t".repeat(32),
            rmcb_list: vec![RmcbPayload {
                instance_id: "i".repeat(32),
                counter: 3,
                transfer_session_id: "t".repeat(32),
                model_uuid: "m".repeat(32),
            }],
        }
    }

    #[test]
    fn wire_field_names() {
        let json = serde_json::to_value(payload()).unwrap();
        assert!(json.get("_self_ref_fk").is_some());
        assert!(json.get("transfer_session").is_some());
        assert!(json.get("transfer_session_id").is_none());
        let rmcb = &json["rmcb_list"][0];
        assert!(rmcb.get("transfer_session").is_some());
    }

    #[test]
    fn records_roundtrip() {
        let original = payload();
        let (buffer, rmcbs) = original.clone().into_records();
        assert_eq!(buffer.model_uuid, original.model_uuid);
        assert_eq!(rmcbs.len(), 1);
        let back = BufferPayload::from_records(&buffer, &rmcbs);
        assert_eq!(back, original);
    }

    #[test]
    fn json_roundtrip() {
        let original = payload();
        let text = serde_json::to_string(&original).unwrap();
        let back: BufferPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, original);
    }
}
