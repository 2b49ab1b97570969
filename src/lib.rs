//! # Trellis
//!
//! Consensus engine for a DAG ledger in which every unit references several
//! parent units:
//! - **Main chain selection**: a single canonical path through the DAG chosen by
//!   the best-parent rule, with main-chain indices partitioning the whole graph
//! - **Witnessed levels and stability**: a majority-of-witnesses rule decides when
//!   a prefix of the main chain can never be reordered again
//! - **Conflict resolution**: concurrent units by the same author are ordered
//!   deterministically, losers become `final-bad`
//! - **Balls and skiplists**: stability-time fingerprints that light clients can
//!   recompute independently
//! - **Dependency tracking**: units whose parents are unknown wait until they arrive

pub mod config;
pub mod consensus;
pub mod node;
pub mod validation;

/// Protocol constants
pub mod constants {
    /// Number of addresses in every witness list.
    pub const COUNT_WITNESSES: usize = 12;
    /// Distinct witness authors needed to fix a witnessed level.
    pub const MAJORITY_OF_WITNESSES: usize = COUNT_WITNESSES / 2 + 1;
    /// How many witnesses may differ between a unit and its best parent.
    pub const MAX_WITNESS_LIST_MUTATIONS: usize = 1;
    /// Maximum number of parent references per unit.
    pub const MAX_PARENTS_PER_UNIT: usize = 16;
    /// Maximum number of authors per unit.
    pub const MAX_AUTHORS_PER_UNIT: usize = 16;
    /// Maximum number of outputs a single unit may spend.
    pub const MAX_INPUTS_PER_UNIT: usize = 128;

    /// Maximum size of a single persisted record (4 MiB).
    pub const MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;

    /// Base of the skiplist: main-chain units at multiples of this are linked back.
    pub const SKIPLIST_BASE: u64 = 10;

    /// Missing parents waited on longer than this are reported as lost (ms).
    pub const LOST_UNIT_TIMEOUT_MS: u64 = 8_000;
    /// Unhandled units older than this are purged (ms).
    pub const UNHANDLED_TTL_MS: u64 = 3_600_000;
    /// Stable final-bad free units this many MCIs below the stable point are archived.
    pub const ARCHIVE_DEPTH: u64 = 1_000;

    /// Capacity of the consensus event broadcast channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

    /// Historical last-ball MCI from which the last ball unit must be stable in
    /// view of the parents.
    pub const LEGACY_LAST_BALL_STABLE_IN_PARENTS_MCI: u64 = 1_300_000;
    /// Historical last-ball MCI from which a unit's witnessed level may not be
    /// below its best parent's.
    pub const LEGACY_WITNESSED_LEVEL_MUST_NOT_RETREAT_MCI: u64 = 1_400_000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain is a `&str` because BLAKE3 key derivation requires a UTF-8 context.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_RECORD_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_RECORD_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_deterministic() {
        let a = hash_domain("trellis.test", b"hello");
        let b = hash_domain("trellis.test", b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_domain_different_domains() {
        let a = hash_domain("trellis.domain_a", b"data");
        let b = hash_domain("trellis.domain_b", b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_concat_length_prefix_prevents_ambiguity() {
        let ab_c = hash_concat(&[b"ab", b"c"]);
        let a_bc = hash_concat(&[b"a", b"bc"]);
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn majority_is_more_than_half() {
        assert_eq!(constants::MAJORITY_OF_WITNESSES, 7);
        assert!(constants::MAJORITY_OF_WITNESSES * 2 > constants::COUNT_WITNESSES);
    }

    #[test]
    fn deserialize_rejects_oversized_input() {
        let oversized = vec![0u8; constants::MAX_RECORD_BYTES + 1];
        let result = deserialize::<Vec<u8>>(&oversized);
        assert!(result.is_err(), "oversized input should be rejected");
    }
}
