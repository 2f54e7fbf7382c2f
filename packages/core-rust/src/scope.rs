//! Scope definitions and their instantiated read/write filters.
//!
//! A [`ScopeDefinition`] is a named template: newline-delimited partition
//! strings containing `${var}` placeholders. Instantiating a definition with
//! a certificate's `scope_params` produces a [`Scope`], the concrete pair of
//! read and write [`Filter`]s that bound what the certificate holder may sync.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// A named, versioned scope template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    /// Identifier referenced from certificates.
    pub id: String,
    /// The profile this scope belongs to.
    pub profile: String,
    /// Incremented whenever the templates change.
    pub version: i32,
    /// The scope_params key that receives the root certificate's id when a
    /// root is generated from this definition. Empty when this definition
    /// cannot anchor a root certificate.
    pub primary_scope_param_key: String,
    /// Human-readable description; may reference `${params}`.
    pub description: String,
    /// Newline-delimited partition templates granting read access.
    pub read_filter_template: String,
    /// Newline-delimited partition templates granting write access.
    pub write_filter_template: String,
    /// Newline-delimited partition templates granting both.
    pub read_write_filter_template: String,
}

impl ScopeDefinition {
    /// Instantiate this definition with the given params.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeParamsError`] when `params` is not a JSON object of
    /// string values.
    pub fn get_scope(&self, params: &str) -> Result<Scope, ScopeParamsError> {
        Scope::new(self, params)
    }

    /// Render the description with params substituted.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeParamsError`] when `params` fails to parse.
    pub fn get_description(&self, params: &str) -> Result<String, ScopeParamsError> {
        let params = parse_params(params)?;
        Ok(substitute(&self.description, &params))
    }
}

/// Raised when certificate `scope_params` cannot be interpreted.
#[derive(Debug, thiserror::Error)]
#[error("invalid scope params: {0}")]
pub struct ScopeParamsError(String);

fn parse_params(params: &str) -> Result<HashMap<String, String>, ScopeParamsError> {
    if params.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(params).map_err(|e| ScopeParamsError(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ScopeParamsError("params must be a JSON object".into()))?;
    object
        .iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => Ok((k.clone(), s.clone())),
            other => Ok((k.clone(), other.to_string())),
        })
        .collect()
}

/// Replace `${name}` placeholders with values from `params`, leaving unknown
/// placeholders untouched so partially-instantiated templates stay visible.
fn substitute(template: &str, params: &HashMap<String, String>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{(\w+)\}").expect("placeholder pattern is a valid regex")
    });
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        params
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// The instantiated (read, write) filter pair of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub read_filter: Filter,
    pub write_filter: Filter,
}

impl Scope {
    /// Instantiate a scope from a definition and serialized params.
    ///
    /// The read/write template contributes to both filters, prepended so its
    /// partitions take precedence in ordering.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeParamsError`] when `params` fails to parse.
    pub fn new(definition: &ScopeDefinition, params: &str) -> Result<Self, ScopeParamsError> {
        let params = parse_params(params)?;
        let rw: Filter = substitute(&definition.read_write_filter_template, &params)
            .parse()
            .unwrap_or_else(|_| Filter::empty());
        let read: Filter = substitute(&definition.read_filter_template, &params)
            .parse()
            .unwrap_or_else(|_| Filter::empty());
        let write: Filter = substitute(&definition.write_filter_template, &params)
            .parse()
            .unwrap_or_else(|_| Filter::empty());
        Ok(Self {
            read_filter: rw.clone() + read,
            write_filter: rw + write,
        })
    }

    /// True when both filters are subsets of the other scope's filters.
    #[must_use]
    pub fn is_subset_of(&self, other: &Scope) -> bool {
        self.read_filter.is_subset_of(&other.read_filter)
            && self.write_filter.is_subset_of(&other.write_filter)
    }

    /// All partitions across both filters, for root-scope validation.
    #[must_use]
    pub fn all_partitions(&self) -> Vec<&String> {
        self.read_filter
            .iter()
            .chain(self.write_filter.iter())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> ScopeDefinition {
        ScopeDefinition {
            id: "full-facility".into(),
            profile: "facilitydata".into(),
            version: 1,
            primary_scope_param_key: "dataset_id".into(),
            description: "Full access to facility ${dataset_id}".into(),
            read_filter_template: "${dataset_id}:shared".into(),
            write_filter_template: String::new(),
            read_write_filter_template: "${dataset_id}".into(),
        }
    }

    #[test]
    fn instantiates_filters_from_templates() {
        let scope = definition().get_scope(r#"{"dataset_id": "abc123"}"#).unwrap();
        assert_eq!(scope.read_filter.partitions(), ["abc123", "abc123:shared"]);
        assert_eq!(scope.write_filter.partitions(), ["abc123"]);
    }

    #[test]
    fn unknown_placeholders_survive_substitution() {
        let def = ScopeDefinition {
            read_filter_template: "${dataset_id}:user:${user_id}".into(),
            ..definition()
        };
        let scope = def.get_scope(r#"{"dataset_id": "abc"}"#).unwrap();
        assert_eq!(scope.read_filter.partitions()[1], "abc:user:${user_id}");
    }

    #[test]
    fn empty_params_yield_raw_templates() {
        let scope = definition().get_scope("").unwrap();
        assert_eq!(scope.write_filter.partitions(), ["${dataset_id}"]);
    }

    #[test]
    fn rejects_non_object_params() {
        assert!(definition().get_scope("[1, 2]").is_err());
        assert!(definition().get_scope("not json").is_err());
    }

    #[test]
    fn scope_subset_checks_both_filters() {
        let parent = definition().get_scope(r#"{"dataset_id": "abc"}"#).unwrap();
        let child_def = ScopeDefinition {
            id: "single-user".into(),
            primary_scope_param_key: String::new(),
            read_filter_template: "${dataset_id}:shared".into(),
            write_filter_template: String::new(),
            read_write_filter_template: "${dataset_id}:user:${user_id}".into(),
            ..definition()
        };
        let child = child_def
            .get_scope(r#"{"dataset_id": "abc", "user_id": "u1"}"#)
            .unwrap();
        assert!(child.is_subset_of(&parent));
        assert!(!parent.is_subset_of(&child));
    }

    #[test]
    fn scope_outside_parent_is_not_subset() {
        let parent = definition().get_scope(r#"{"dataset_id": "abc"}"#).unwrap();
        let foreign = definition().get_scope(r#"{"dataset_id": "zzz"}"#).unwrap();
        assert!(!foreign.is_subset_of(&parent));
    }

    #[test]
    fn description_substitution() {
        let description = definition()
            .get_description(r#"{"dataset_id": "abc"}"#)
            .unwrap();
        assert_eq!(description, "Full access to facility abc");
    }

    #[test]
    fn non_string_param_values_are_stringified() {
        let def = ScopeDefinition {
            read_write_filter_template: "${dataset_id}:v${version}".into(),
            ..definition()
        };
        let scope = def
            .get_scope(r#"{"dataset_id": "abc", "version": 3}"#)
            .unwrap();
        assert_eq!(scope.read_filter.partitions()[0], "abc:v3");
    }
}
