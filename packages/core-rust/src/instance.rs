//! Database and instance identity.
//!
//! A [`DatabaseId`] is a random id minted once per database. An
//! [`InstanceId`] identifies the (database, platform, hostname, node, path)
//! tuple this engine currently runs as; if any of those change, the instance
//! id changes with them. The instance's monotonic counter is stamped onto
//! every record it serializes, forming the per-record vector clocks.

use serde::{Deserialize, Serialize};

use crate::uuids::sha2_uuid;

/// A random id identifying one database. At most one row is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseId {
    pub id: String,
    pub current: bool,
    /// Unix millis at creation.
    pub date_generated: i64,
    /// The first instance id generated against this database, for debugging.
    pub initial_instance_id: String,
}

/// The identity of this engine on this machine, with its monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId {
    /// `sha2_uuid` over the identity fields below, in declaration order.
    pub id: String,
    pub platform: String,
    pub hostname: String,
    pub sysversion: String,
    /// Stable node identifier (e.g. hashed MAC address); may be empty.
    pub node_id: String,
    pub database_id: String,
    pub db_path: String,
    pub system_id: String,
    /// Incremented atomically before each serialization pass.
    pub counter: i64,
    pub current: bool,
}

impl InstanceId {
    /// Derive the content-addressed id from the identity fields.
    #[must_use]
    pub fn calculate_id(&self) -> String {
        sha2_uuid(&[
            &self.platform,
            &self.hostname,
            &self.sysversion,
            &self.node_id,
            &self.database_id,
            &self.db_path,
        ])
    }

    /// Human-readable pairing code derived from the first 32 bits of the id.
    #[must_use]
    pub fn get_proquint(&self) -> String {
        let prefix = u32::from_str_radix(&self.id[..8.min(self.id.len())], 16).unwrap_or(0);
        proquint_from_u32(prefix)
    }
}

const PROQUINT_CONSONANTS: [char; 16] = [
    'b', 'd', 'f', 'g', 'h', 'j', 'k', 'l', 'm', 'n', 'p', 'r', 's', 't', 'v', 'z',
];
const PROQUINT_VOWELS: [char; 4] = ['a', 'i', 'o', 'u'];

fn proquint_syllables(half: u16) -> [char; 5] {
    [
        PROQUINT_CONSONANTS[usize::from(half >> 12) & 0xF],
        PROQUINT_VOWELS[usize::from(half >> 10) & 0x3],
        PROQUINT_CONSONANTS[usize::from(half >> 6) & 0xF],
        PROQUINT_VOWELS[usize::from(half >> 4) & 0x3],
        PROQUINT_CONSONANTS[usize::from(half) & 0xF],
    ]
}

/// Render a 32-bit value as two dash-joined proquint quintets.
#[must_use]
pub fn proquint_from_u32(value: u32) -> String {
    #[allow(clippy::cast_possible_truncation)]
    let halves = [(value >> 16) as u16, (value & 0xFFFF) as u16];
    halves
        .iter()
        .map(|half| proquint_syllables(*half).iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
