//! Filter-specific instance counter (FSIC) algebra.
//!
//! An FSIC is the compact summary a peer exchanges to describe what data it
//! already holds, so the other side can compute the minimal record set to
//! send. Two layouts exist on the wire:
//!
//! - **v1 (flat)**: `{instance_id -> counter}`, the minimum counter across
//!   all filter partitions for each instance.
//! - **v2 (nested)**: `{"super": {partition -> {instance -> counter}},
//!   "sub": {...}}`. A "super" entry covers a partition and everything below
//!   it; "sub" entries attach to specific sub-partitions. v2 preserves the
//!   per-partition precision that v1 collapses.
//!
//! The v2 helpers here mirror each other: [`remove_redundant_instance_counters`]
//! shrinks an FSIC before it goes on the wire, and [`expand_fsic_for_use`]
//! re-inflates a received one by propagating super counters down into subs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// `{instance_id -> counter}`.
pub type InstanceCounters = BTreeMap<String, i64>;

/// `{partition -> {instance_id -> counter}}`.
pub type PartitionCounters = BTreeMap<String, InstanceCounters>;

/// The nested v2 wire layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsicV2 {
    /// Counters covering a partition and all its descendants.
    #[serde(rename = "super")]
    pub super_partitions: PartitionCounters,
    /// Counters attached to specific sub-partitions.
    #[serde(rename = "sub")]
    pub sub_partitions: PartitionCounters,
}

/// Either FSIC wire layout, as parsed from a transfer session field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fsic {
    V1(InstanceCounters),
    V2(FsicV2),
}

impl Fsic {
    /// Parse an FSIC from its JSON text form. An object carrying both
    /// `super` and `sub` keys is v2; anything else is a flat v1 map.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` when the text is not valid JSON of
    /// either shape.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("super").is_some() && value.get("sub").is_some() {
            Ok(Self::V2(serde_json::from_value(value)?))
        } else {
            Ok(Self::V1(serde_json::from_value(value)?))
        }
    }

    /// Render the JSON text form stored on transfer sessions.
    #[must_use]
    pub fn to_json(&self) -> String {
        match self {
            // Maps of strings and integers always encode.
            Self::V1(counters) => {
                serde_json::to_string(counters).expect("instance counter maps always encode")
            }
            Self::V2(fsic) => serde_json::to_string(fsic).expect("fsic v2 always encodes"),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::V1(counters) => counters.is_empty(),
            Self::V2(fsic) => {
                fsic.super_partitions.is_empty() && fsic.sub_partitions.is_empty()
            }
        }
    }
}

/// Map each key to the other keys that are its (strict or inclusive)
/// prefixes.
fn build_prefix_mapper<'a, I>(keys: I, include_self: bool) -> HashMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let keys: Vec<&String> = keys.into_iter().collect();
    let mut mapper: HashMap<String, Vec<String>> = HashMap::new();
    for key in &keys {
        for other in &keys {
            if key.starts_with(other.as_str()) && (include_self || key != other) {
                mapper
                    .entry((*key).clone())
                    .or_default()
                    .push((*other).clone());
            }
        }
    }
    mapper
}

/// The subset of `partitions` that are strict extensions of another entry.
fn get_sub_partitions(partitions: &PartitionCounters) -> Vec<String> {
    let mut subordinates = Vec::new();
    for partition in partitions.keys() {
        for other in partitions.keys() {
            if partition != other && partition.starts_with(other.as_str()) {
                subordinates.push(partition.clone());
                break;
            }
        }
    }
    subordinates
}

/// Remove any `(instance, counter)` entry whose counter is covered by an
/// equal-or-higher counter for the same instance under a prefix partition.
///
/// Emptied partitions are kept as empty maps: downstream code still needs to
/// know the partition carries data.
pub fn remove_redundant_instance_counters(fsic: &mut FsicV2) {
    // Merged snapshot for prefix lookups; sub entries shadow super on ties.
    let mut merged: PartitionCounters = fsic.super_partitions.clone();
    for (part, counters) in &fsic.sub_partitions {
        merged.insert(part.clone(), counters.clone());
    }
    let prefix_mapper = build_prefix_mapper(merged.keys(), false);

    for partitions in [&mut fsic.super_partitions, &mut fsic.sub_partitions] {
        for (part, counters) in partitions.iter_mut() {
            let Some(prefixes) = prefix_mapper.get(part) else {
                continue;
            };
            for prefix in prefixes {
                if let Some(super_counters) = merged.get(prefix) {
                    counters.retain(|instance, counter| {
                        super_counters
                            .get(instance)
                            .is_none_or(|covering| *counter > *covering)
                    });
                }
            }
        }
    }
}

/// Convert a raw v2 FSIC from the wire into the expanded per-partition form
/// used for diffing, by propagating super-partition counters down into subs.
///
/// Filter partitions missing from `sub` are added so that a super entry with
/// no matching sub still surfaces; sub-partitions subordinate to another sub
/// are left untouched since their parent already carries the inherited
/// counters. Empty partitions are dropped from the result.
#[must_use]
pub fn expand_fsic_for_use(fsic: &FsicV2, sync_filter: &Filter) -> PartitionCounters {
    let mut sub = fsic.sub_partitions.clone();

    for partition in sync_filter {
        sub.entry(partition.clone()).or_default();
    }

    let subordinates = get_sub_partitions(&sub);

    for (sub_part, sub_counters) in &mut sub {
        if subordinates.contains(sub_part) {
            continue;
        }
        for (super_part, super_counters) in &fsic.super_partitions {
            if !sub_part.starts_with(super_part.as_str()) {
                continue;
            }
            for (instance, counter) in super_counters {
                let entry = sub_counters.entry(instance.clone()).or_insert(0);
                if *counter > *entry {
                    *entry = *counter;
                }
            }
        }
    }

    sub.retain(|_, counters| !counters.is_empty());
    sub
}

/// Compute the v1 lower-bound counters the sender must surpass: an entry for
/// each instance where `sender > receiver` (missing treated as 0), valued at
/// the receiver's counter.
#[must_use]
pub fn calculate_directional_fsic_diff(
    sender: &InstanceCounters,
    receiver: &InstanceCounters,
) -> InstanceCounters {
    sender
        .iter()
        .filter_map(|(instance, counter)| {
            let receiving = receiver.get(instance).copied().unwrap_or(0);
            (receiving < *counter).then(|| (instance.clone(), receiving))
        })
        .collect()
}

/// The v2 analogue of [`calculate_directional_fsic_diff`], operating on
/// expanded per-partition maps. The receiver side inherits counters from any
/// prefix partition it holds, so data under a broad receiver partition is
/// not re-sent for its sub-partitions.
#[must_use]
pub fn calculate_directional_fsic_diff_v2(
    sender: &PartitionCounters,
    receiver: &PartitionCounters,
) -> PartitionCounters {
    let prefixes = build_prefix_mapper(sender.keys().chain(receiver.keys()), true);

    let mut result = PartitionCounters::new();
    for (part, instances) in sender {
        for (instance, sending_counter) in instances {
            let receiving_counter = prefixes
                .get(part)
                .map(|parts| {
                    parts
                        .iter()
                        .map(|prefix| {
                            receiver
                                .get(prefix)
                                .and_then(|counters| counters.get(instance))
                                .copied()
                                .unwrap_or(0)
                        })
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            if receiving_counter < *sending_counter {
                result
                    .entry(part.clone())
                    .or_default()
                    .insert(instance.clone(), receiving_counter);
            }
        }
    }
    result
}

/// Split an expanded v2 FSIC into chunks holding at most `chunk_size`
/// partitions-plus-instances each, to bound request sizes.
#[must_use]
pub fn chunk_fsic_v2(fsics: &PartitionCounters, chunk_size: usize) -> Vec<PartitionCounters> {
    let mut chunks = Vec::new();
    let mut current = PartitionCounters::new();
    let mut remaining = chunk_size as i64;

    for (part, instances) in fsics {
        remaining -= 1;
        for (instance, counter) in instances {
            if remaining <= 0 {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                remaining = chunk_size as i64 - 1;
            }
            current
                .entry(part.clone())
                .or_default()
                .insert(instance.clone(), *counter);
            remaining -= 1;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(pairs: &[(&str, i64)]) -> InstanceCounters {
        pairs
            .iter()
            .map(|(instance, counter)| ((*instance).to_string(), *counter))
            .collect()
    }

    fn partitions(entries: &[(&str, &[(&str, i64)])]) -> PartitionCounters {
        entries
            .iter()
            .map(|(part, pairs)| ((*part).to_string(), counters(pairs)))
            .collect()
    }

    #[test]
    fn expand_propagates_super_counters_down() {
        let fsic = FsicV2 {
            super_partitions: partitions(&[("p", &[("a", 5), ("b", 3), ("c", 7)])]),
            sub_partitions: partitions(&[
                ("p1", &[("a", 1), ("b", 9), ("d", 2)]),
                ("p1i", &[("e", 5)]),
                ("p2i", &[("e", 5)]),
            ]),
        };
        let expanded = expand_fsic_for_use(&fsic, &Filter::empty());
        let expected = partitions(&[
            // a from super (larger), b from sub (larger), c and d merged in
            ("p1", &[("a", 5), ("b", 9), ("c", 7), ("d", 2)]),
            // subordinate to p1, so it does not inherit from super directly
            ("p1i", &[("e", 5)]),
            // no prefix among the subs, so it inherits everything from super
            ("p2i", &[("a", 5), ("b", 3), ("c", 7), ("e", 5)]),
        ]);
        assert_eq!(expanded, expected);
    }

    #[test]
    fn expand_adds_filter_partitions() {
        let fsic = FsicV2 {
            super_partitions: partitions(&[("p", &[("a", 5)])]),
            sub_partitions: PartitionCounters::new(),
        };
        let filter: Filter = "p1".into();
        let expanded = expand_fsic_for_use(&fsic, &filter);
        assert_eq!(expanded, partitions(&[("p1", &[("a", 5)])]));
    }

    #[test]
    fn expand_drops_empty_partitions() {
        let fsic = FsicV2::default();
        let filter: Filter = "p1\np2".into();
        assert!(expand_fsic_for_use(&fsic, &filter).is_empty());
    }

    #[test]
    fn remove_redundant_strips_covered_counters() {
        let mut fsic = FsicV2 {
            super_partitions: partitions(&[
                ("p", &[("a", 5), ("b", 3), ("c", 7)]),
                ("p3", &[("a", 1), ("c", 8), ("d", 14)]),
            ]),
            sub_partitions: partitions(&[
                ("p1", &[("a", 5), ("b", 9), ("c", 7), ("d", 2)]),
                ("p1i", &[("e", 5), ("c", 4), ("d", 1)]),
                ("p1j", &[("b", 3), ("c", 5)]),
                ("p2i", &[("a", 5), ("e", 5)]),
                ("p3i", &[("a", 8), ("c", 5), ("d", 2)]),
            ]),
        };
        remove_redundant_instance_counters(&mut fsic);
        let expected = FsicV2 {
            super_partitions: partitions(&[
                ("p", &[("a", 5), ("b", 3), ("c", 7)]),
                ("p3", &[("c", 8), ("d", 14)]),
            ]),
            sub_partitions: partitions(&[
                ("p1", &[("b", 9), ("d", 2)]),
                ("p1i", &[("e", 5)]),
                // emptied but kept, to signal the partition still holds data
                ("p1j", &[]),
                ("p2i", &[("e", 5)]),
                ("p3i", &[("a", 8)]),
            ]),
        };
        assert_eq!(fsic, expected);
    }

    #[test]
    fn v1_diff_yields_receiver_lower_bounds() {
        let sender = counters(&[("a", 5), ("b", 3), ("c", 7)]);
        let receiver = counters(&[("a", 3), ("b", 3), ("d", 2)]);
        let diff = calculate_directional_fsic_diff(&sender, &receiver);
        // a: 5 > 3 so entry at 3; b equal so excluded; c missing so entry at 0.
        assert_eq!(diff, counters(&[("a", 3), ("c", 0)]));
    }

    #[test]
    fn v1_diff_empty_when_receiver_ahead() {
        let sender = counters(&[("a", 5)]);
        let receiver = counters(&[("a", 9)]);
        assert!(calculate_directional_fsic_diff(&sender, &receiver).is_empty());
    }

    #[test]
    fn v2_diff_inherits_from_receiver_prefixes() {
        let sender = partitions(&[
            ("p", &[("a", 5), ("c", 7)]),
            ("p1", &[("b", 9), ("d", 2)]),
            ("p1i", &[("a", 7), ("e", 6), ("f", 1)]),
            ("p2", &[("a", 8), ("q", 5)]),
        ]);
        let receiver = partitions(&[
            ("p", &[("a", 3), ("b", 4), ("c", 9)]),
            ("p1", &[("b", 9), ("d", 2)]),
            ("p1i", &[("a", 6), ("e", 5), ("c", 9)]),
            ("p3", &[("a", 2), ("c", 3)]),
        ]);
        let expected = partitions(&[
            ("p", &[("a", 3)]),
            ("p1i", &[("a", 6), ("e", 5), ("f", 0)]),
            ("p2", &[("a", 3), ("q", 0)]),
        ]);
        assert_eq!(calculate_directional_fsic_diff_v2(&sender, &receiver), expected);
    }

    #[test]
    fn v2_diff_identical_is_empty() {
        let fsic = partitions(&[("p", &[("a", 5), ("c", 7)]), ("p1", &[("b", 9)])]);
        assert!(calculate_directional_fsic_diff_v2(&fsic, &fsic).is_empty());
    }

    #[test]
    fn v2_diff_receiver_ahead_is_empty() {
        let sender = partitions(&[("p", &[("a", 5)]), ("p1", &[("b", 9)])]);
        let receiver = partitions(&[("p", &[("a", 6)]), ("p1", &[("b", 11)])]);
        assert!(calculate_directional_fsic_diff_v2(&sender, &receiver).is_empty());
    }

    #[test]
    fn chunking_bounds_partition_plus_instance_count() {
        let fsics = partitions(&[
            ("p1", &[("a", 1), ("b", 2)]),
            ("p2", &[("c", 3), ("d", 4), ("e", 5)]),
        ]);
        let chunks = chunk_fsic_v2(&fsics, 3);
        // every chunk holds at most 3 partitions+instances
        for chunk in &chunks {
            let weight: usize = chunk.len() + chunk.values().map(BTreeMap::len).sum::<usize>();
            assert!(weight <= 3 + 1, "chunk too large: {chunk:?}");
        }
        // all entries survive chunking
        let mut merged = PartitionCounters::new();
        for chunk in chunks {
            for (part, instances) in chunk {
                merged.entry(part).or_default().extend(instances);
            }
        }
        assert_eq!(merged, fsics);
    }

    #[test]
    fn json_detection_v1_vs_v2() {
        let v1 = Fsic::from_json(r#"{"abc": 4}"#).unwrap();
        assert!(matches!(v1, Fsic::V1(_)));

        let v2 = Fsic::from_json(r#"{"super": {}, "sub": {"p": {"a": 1}}}"#).unwrap();
        assert!(matches!(v2, Fsic::V2(_)));

        let empty = Fsic::from_json("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn json_roundtrip() {
        let original = Fsic::V2(FsicV2 {
            super_partitions: partitions(&[("p", &[("a", 5)])]),
            sub_partitions: partitions(&[("p1", &[("b", 2)])]),
        });
        let text = original.to_json();
        assert_eq!(Fsic::from_json(&text).unwrap(), original);
    }
}
