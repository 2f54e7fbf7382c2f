//! The app-layer record interface.
//!
//! The engine never sees the host application's real models, only dirty-bit
//! tracked JSON rows keyed by content-addressed ids. The host saves and
//! deletes [`AppRecord`]s; the serializer drains dirty rows into the store,
//! and the deserializer writes received rows back.

use serde_json::{Map, Value};

use morango_core::records::{compute_namespaced_id, ID_PLACEHOLDER};

/// One domain record as the engine sees it: an opaque JSON object plus the
/// routing metadata used for content addressing and partition scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub id: String,
    pub profile: String,
    pub model_name: String,
    /// Concrete partition, with any `${id}` placeholder already resolved.
    pub partition: String,
    pub source_id: String,
    /// The serializable app fields.
    pub fields: Map<String, Value>,
    /// Set when the row has changes not yet serialized into the store.
    pub dirty_bit: bool,
}

impl AppRecord {
    /// Build a record, computing its content-addressed id from the partition
    /// template (which may reference `${id}`), source id, and model name.
    #[must_use]
    pub fn new(
        profile: &str,
        model_name: &str,
        partition_template: &str,
        source_id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        let id = compute_namespaced_id(partition_template, source_id, model_name);
        let partition = partition_template.replace(ID_PLACEHOLDER, &id);
        let mut record = Self {
            id: id.clone(),
            profile: profile.to_string(),
            model_name: model_name.to_string(),
            partition,
            source_id: source_id.to_string(),
            fields,
            dirty_bit: true,
        };
        record.fields.insert("id".to_string(), Value::String(id));
        record
    }

    /// The value of a foreign key field, when present and non-null.
    #[must_use]
    pub fn fk_value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
            .collect()
    }

    #[test]
    fn id_is_content_addressed() {
        let a = AppRecord::new("p", "person", "abc:user", "s1", fields(&[("name", "x")]));
        let b = AppRecord::new("p", "person", "abc:user", "s1", fields(&[("name", "y")]));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, compute_namespaced_id("abc:user", "s1", "person"));
    }

    #[test]
    fn placeholder_partition_resolves_to_own_id() {
        let record = AppRecord::new("p", "node", "abc:${id}", "s1", Map::new());
        assert_eq!(record.partition, format!("abc:{}", record.id));
    }

    #[test]
    fn id_field_is_set_on_fields() {
        let record = AppRecord::new("p", "person", "abc", "s1", Map::new());
        assert_eq!(record.fields["id"], Value::String(record.id.clone()));
    }

    #[test]
    fn fk_value_reads_string_fields() {
        let record = AppRecord::new(
            "p",
            "person",
            "abc",
            "s1",
            fields(&[("facility_id", "f123")]),
        );
        assert_eq!(record.fk_value("facility_id"), Some("f123"));
        assert_eq!(record.fk_value("missing"), None);
        let mut with_null = record.clone();
        with_null
            .fields
            .insert("facility_id".into(), Value::Null);
        assert_eq!(with_null.fk_value("facility_id"), None);
    }
}
