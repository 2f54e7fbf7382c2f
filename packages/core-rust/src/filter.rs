//! Partition filters: ordered sets of partition prefix strings.
//!
//! A partition is a colon-delimited path tag on a record, e.g.
//! `"{dataset_id}:user:{user_id}"`. A [`Filter`] is a whitespace/newline
//! delimited list of such prefixes; a record belongs to a filter when its
//! partition starts with any of the filter's prefixes. Filters scope what a
//! certificate may read or write and what a transfer session moves.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An ordered sequence of partition prefix strings.
///
/// The canonical text form joins the prefixes with newlines; parsing splits
/// on any whitespace so templated multi-line filter strings round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    partitions: Vec<String>,
}

impl Filter {
    /// Build a filter from an explicit list of partition prefixes.
    #[must_use]
    pub fn new(partitions: Vec<String>) -> Self {
        Self { partitions }
    }

    /// A filter with no prefixes, which contains nothing and is a subset of
    /// every filter.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            partitions: Vec::new(),
        }
    }

    /// The partition prefixes in order.
    #[must_use]
    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True when every prefix in `self` is itself prefixed by some prefix in
    /// `other`, i.e. every partition matched by `self` is matched by `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Filter) -> bool {
        self.partitions
            .iter()
            .all(|p| other.partitions.iter().any(|q| p.starts_with(q.as_str())))
    }

    /// True when `partition` starts with any of this filter's prefixes.
    #[must_use]
    pub fn contains_partition(&self, partition: &str) -> bool {
        self.partitions
            .iter()
            .any(|p| partition.starts_with(p.as_str()))
    }

    /// Set equality on the partition prefixes, ignoring order.
    #[must_use]
    pub fn equals(&self, other: &Filter) -> bool {
        self.partitions.iter().all(|p| other.partitions.contains(p))
            && other.partitions.iter().all(|p| self.partitions.contains(p))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.partitions.iter()
    }
}

impl FromStr for Filter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            partitions: s.split_whitespace().map(str::to_string).collect(),
        })
    }
}

impl From<&str> for Filter {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Filter::empty())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partitions.join("\n"))
    }
}

impl Add for Filter {
    type Output = Filter;

    /// Concatenate the prefix lists, preserving order.
    fn add(mut self, other: Filter) -> Filter {
        self.partitions.extend(other.partitions);
        self
    }
}

impl<'a> IntoIterator for &'a Filter {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.iter()
    }
}
