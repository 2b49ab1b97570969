//! Units: the content-addressed vertices of the ledger DAG.
//!
//! A `Unit` is immutable once created and identified by the hash of its
//! canonical fields. Everything the consensus engine derives about a unit
//! (level, main-chain index, stability, sequence, ball) lives separately in
//! `UnitProps`, which only the engine ever mutates.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ball::BallId;
use crate::Hash;

/// Unique identifier for a unit (hash of its content).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub Hash);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self)
    }
}

impl UnitId {
    /// Parse a full 64-character hex id.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let hash: Hash = bytes.as_slice().try_into().ok()?;
        Some(UnitId(hash))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// An author or witness address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub Hash);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Reference to an output of an earlier unit that this unit spends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub unit: UnitId,
    pub message_index: u32,
    pub output_index: u32,
}

/// Serial classification of a unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sequence {
    /// Canonical, conflict-free.
    #[default]
    Good,
    /// Conflicts with a unit whose outcome is not final yet.
    TempBad,
    /// Lost a conflict; permanently stored but economically void.
    FinalBad,
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sequence::Good => "good",
            Sequence::TempBad => "temp-bad",
            Sequence::FinalBad => "final-bad",
        };
        f.write_str(s)
    }
}

/// A unit as authored: immutable content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Content hash of all other fields
    pub id: UnitId,
    /// Parent unit ids, sorted ascending without duplicates (empty only for genesis)
    pub parent_units: Vec<UnitId>,
    /// Ball of the last stable unit the author saw
    pub last_ball: Option<BallId>,
    /// Unit carrying `last_ball`
    pub last_ball_unit: Option<UnitId>,
    /// Inline witness list (exclusive with `witness_list_unit`)
    pub witnesses: Option<Vec<Address>>,
    /// Stable unit whose inline witness list this unit adopts
    pub witness_list_unit: Option<UnitId>,
    /// Author addresses, sorted ascending
    pub authors: Vec<Address>,
    /// Outputs of earlier units spent by this unit
    pub inputs: Vec<OutputRef>,
    /// Commitment to the application payload (opaque to consensus)
    pub payload_hash: Hash,
    /// Timestamp (unix millis, advisory only)
    pub timestamp: u64,
}

impl Unit {
    /// Compute the unit id from its content fields.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        parent_units: &[UnitId],
        last_ball: Option<&BallId>,
        last_ball_unit: Option<&UnitId>,
        witnesses: Option<&[Address]>,
        witness_list_unit: Option<&UnitId>,
        authors: &[Address],
        inputs: &[OutputRef],
        payload_hash: &Hash,
        timestamp: u64,
    ) -> UnitId {
        let mut hasher = blake3::Hasher::new_derive_key("trellis.unit.id");
        hasher.update(&(parent_units.len() as u64).to_le_bytes());
        for p in parent_units {
            hasher.update(&p.0);
        }
        match (last_ball, last_ball_unit) {
            (Some(ball), Some(unit)) => {
                hasher.update(&[1]);
                hasher.update(&ball.0);
                hasher.update(&unit.0);
            }
            _ => {
                hasher.update(&[0]);
            }
        }
        match (witnesses, witness_list_unit) {
            (Some(list), _) => {
                hasher.update(&[1]);
                hasher.update(&(list.len() as u64).to_le_bytes());
                for w in list {
                    hasher.update(&w.0);
                }
            }
            (None, Some(unit)) => {
                hasher.update(&[2]);
                hasher.update(&unit.0);
            }
            (None, None) => {
                hasher.update(&[0]);
            }
        }
        hasher.update(&(authors.len() as u64).to_le_bytes());
        for a in authors {
            hasher.update(&a.0);
        }
        hasher.update(&(inputs.len() as u64).to_le_bytes());
        for input in inputs {
            hasher.update(&input.unit.0);
            hasher.update(&input.message_index.to_le_bytes());
            hasher.update(&input.output_index.to_le_bytes());
        }
        hasher.update(payload_hash);
        hasher.update(&timestamp.to_le_bytes());
        UnitId(*hasher.finalize().as_bytes())
    }

    /// Recompute this unit's id from its fields.
    pub fn content_id(&self) -> UnitId {
        Self::compute_id(
            &self.parent_units,
            self.last_ball.as_ref(),
            self.last_ball_unit.as_ref(),
            self.witnesses.as_deref(),
            self.witness_list_unit.as_ref(),
            &self.authors,
            &self.inputs,
            &self.payload_hash,
            self.timestamp,
        )
    }

    /// Hash identifying the unit after its spent outputs have been stripped.
    pub fn content_hash(&self) -> Hash {
        let bytes = crate::serialize(self).unwrap_or_default();
        crate::hash_domain("trellis.unit.content", &bytes)
    }

    /// Genesis unit: no parents, authored by every witness on its inline list.
    pub fn genesis(witnesses: &[Address]) -> Unit {
        UnitBuilder::new()
            .witnesses(witnesses.iter().copied())
            .authors_all(witnesses.iter().copied())
            .build()
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_units.is_empty()
    }

    /// Units this unit cannot be processed without.
    pub fn references(&self) -> Vec<UnitId> {
        let mut refs = self.parent_units.clone();
        if let Some(lbu) = self.last_ball_unit {
            refs.push(lbu);
        }
        if let Some(wlu) = self.witness_list_unit {
            refs.push(wlu);
        }
        refs.sort();
        refs.dedup();
        refs
    }
}

/// Builder for units, computing the id once all fields are set.
#[derive(Clone, Debug, Default)]
pub struct UnitBuilder {
    parent_units: Vec<UnitId>,
    last_ball: Option<(BallId, UnitId)>,
    witnesses: Option<Vec<Address>>,
    witness_list_unit: Option<UnitId>,
    authors: Vec<Address>,
    inputs: Vec<OutputRef>,
    payload_hash: Hash,
    timestamp: u64,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parents(mut self, parents: impl IntoIterator<Item = UnitId>) -> Self {
        let mut parents: Vec<UnitId> = parents.into_iter().collect();
        parents.sort();
        parents.dedup();
        self.parent_units = parents;
        self
    }

    pub fn last_ball(mut self, ball: BallId, unit: UnitId) -> Self {
        self.last_ball = Some((ball, unit));
        self
    }

    pub fn witnesses(mut self, witnesses: impl IntoIterator<Item = Address>) -> Self {
        let mut list: Vec<Address> = witnesses.into_iter().collect();
        list.sort();
        self.witnesses = Some(list);
        self.witness_list_unit = None;
        self
    }

    pub fn witness_list_unit(mut self, unit: UnitId) -> Self {
        self.witness_list_unit = Some(unit);
        self.witnesses = None;
        self
    }

    pub fn author(mut self, author: Address) -> Self {
        self.authors.push(author);
        self.authors.sort();
        self.authors.dedup();
        self
    }

    pub fn authors_all(mut self, authors: impl IntoIterator<Item = Address>) -> Self {
        self.authors.extend(authors);
        self.authors.sort();
        self.authors.dedup();
        self
    }

    pub fn spend(mut self, output: OutputRef) -> Self {
        self.inputs.push(output);
        self
    }

    pub fn payload_hash(mut self, hash: Hash) -> Self {
        self.payload_hash = hash;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn build(self) -> Unit {
        let (last_ball, last_ball_unit) = match self.last_ball {
            Some((ball, unit)) => (Some(ball), Some(unit)),
            None => (None, None),
        };
        let id = Unit::compute_id(
            &self.parent_units,
            last_ball.as_ref(),
            last_ball_unit.as_ref(),
            self.witnesses.as_deref(),
            self.witness_list_unit.as_ref(),
            &self.authors,
            &self.inputs,
            &self.payload_hash,
            self.timestamp,
        );
        Unit {
            id,
            parent_units: self.parent_units,
            last_ball,
            last_ball_unit,
            witnesses: self.witnesses,
            witness_list_unit: self.witness_list_unit,
            authors: self.authors,
            inputs: self.inputs,
            payload_hash: self.payload_hash,
            timestamp: self.timestamp,
        }
    }
}

/// Consensus-derived properties of a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProps {
    pub level: u64,
    pub witnessed_level: u64,
    pub best_parent: Option<UnitId>,
    pub main_chain_index: Option<u64>,
    pub latest_included_mc_index: Option<u64>,
    pub is_on_main_chain: bool,
    pub is_free: bool,
    pub is_stable: bool,
    pub sequence: Sequence,
    pub ball: Option<BallId>,
    /// Main-chain units this unit's ball links back to
    #[serde(default)]
    pub skiplist: Vec<UnitId>,
    /// Set when the unit stabilizes as final-bad
    #[serde(default)]
    pub content_hash: Option<Hash>,
    #[serde(default)]
    pub archived: bool,
}
