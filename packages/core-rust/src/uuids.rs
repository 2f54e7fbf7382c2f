//! Content-addressed and random identifiers.
//!
//! Every identifier in the system is a 32-character lowercase hex string.
//! Content-addressed ids are derived from SHA-256 over the `::`-joined
//! non-empty inputs, truncated to 128 bits, so that independently operating
//! peers compute identical ids for the same logical record.

use sha2::{Digest, Sha256};

/// Number of hex characters in every identifier.
pub const UUID_LEN: usize = 32;

/// Compute a content-addressed 32-hex id from the given inputs.
///
/// Empty inputs are skipped before joining with `::`, so a missing salt or
/// source id does not shift the hash input of the remaining parts.
///
/// # Examples
///
/// ```
/// use morango_core::uuids::sha2_uuid;
///
/// let id = sha2_uuid(&["part", "source", "model"]);
/// assert_eq!(id.len(), 32);
/// assert_eq!(id, sha2_uuid(&["part", "source", "model"]));
/// ```
#[must_use]
pub fn sha2_uuid(inputs: &[&str]) -> String {
    let joined = inputs
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("::");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)[..UUID_LEN].to_string()
}

/// Generate a random 32-hex id.
#[must_use]
pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Check that a string is a well-formed 32-character lowercase hex id.
#[must_use]
pub fn is_valid_uuid(value: &str) -> bool {
    value.len() == UUID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha2_uuid_is_deterministic() {
        let a = sha2_uuid(&["partition", "source", "model"]);
        let b = sha2_uuid(&["partition", "source", "model"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), UUID_LEN);
        assert!(is_valid_uuid(&a));
    }

    #[test]
    fn sha2_uuid_skips_empty_inputs() {
        // A missing salt must not change the joined hash input.
        let with_empty = sha2_uuid(&["pubkey", "profile", ""]);
        let without = sha2_uuid(&["pubkey", "profile"]);
        assert_eq!(with_empty, without);
    }

    #[test]
    fn sha2_uuid_differs_on_input_order() {
        assert_ne!(sha2_uuid(&["a", "b"]), sha2_uuid(&["b", "a"]));
    }

    #[test]
    fn sha2_uuid_is_prefix_of_full_digest() {
        use sha2::{Digest, Sha256};
        let id = sha2_uuid(&["p", "s", "m"]);
        let full = hex::encode(Sha256::digest(b"p::s::m"));
        assert_eq!(id, full[..32]);
    }

    #[test]
    fn random_uuid_shape_and_uniqueness() {
        let a = random_uuid();
        let b = random_uuid();
        assert!(is_valid_uuid(&a));
        assert!(is_valid_uuid(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn is_valid_uuid_rejects_bad_input() {
        assert!(!is_valid_uuid(""));
        assert!(!is_valid_uuid("abc"));
        assert!(!is_valid_uuid(&"G".repeat(32)));
        assert!(!is_valid_uuid(&"A".repeat(32))); // uppercase hex is not canonical
        assert!(!is_valid_uuid(&"a".repeat(33)));
    }
}
