//! # DAG consensus engine
//!
//! Orders a DAG of units deterministically so that independent nodes fed the
//! same units agree bit-for-bit on the outcome.
//!
//! ## Pipeline
//!
//! ```text
//! new unit appended
//!   1. main_chain: pick the best free unit, walk best parents down until the
//!      old main chain is rejoined, re-index everything above that point
//!   2. limci: recompute latest-included-MC-index for every unit above it
//!   3. stability: while the first unstable MC unit satisfies the
//!      majority-of-witnesses rule, mark its MCI stable
//!   4. conflict: decide good / final-bad for nonserial units at that MCI,
//!      then assign balls and skiplists
//! ```
//!
//! Every step is an explicit loop over a worklist; nothing recurses on the
//! depth of the DAG. Any inconsistency detected along the way is a
//! [`ConsensusError`], which is fatal for the unit being written: the caller
//! must roll back and must not retry.

pub mod audit;
pub mod ball;
pub mod conflict;
pub mod graph;
pub mod limci;
pub mod main_chain;
pub mod stability;
pub mod state;
pub mod unit;
pub mod witness;

pub use ball::BallId;
pub use graph::Relation;
pub use state::{ConsensusState, UnitIdx, UnitRecord};
pub use unit::{Address, OutputRef, Sequence, Unit, UnitBuilder, UnitId, UnitProps};

/// Fatal consensus invariant violations.
///
/// These indicate a corrupted local store or a bug. They are never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("unit not found: {0}")]
    UnknownUnit(UnitId),
    #[error("no free units")]
    NoFreeUnits,
    #[error("main chain rebuild from mci {rejoin_mci} would remove stable unit {unit}")]
    RebuildBelowStable { unit: UnitId, rejoin_mci: u64 },
    #[error("not a single main-chain best child of stable unit {0}")]
    NotSingleMcChild(UnitId),
    #[error("not a single free main-chain unit ({0} found)")]
    NotSingleMcTip(usize),
    #[error("no best parent for non-genesis unit {0}")]
    NoBestParent(UnitId),
    #[error("best parent mismatch for {unit}: expected {expected}, recomputed {recomputed}")]
    BestParentMismatch {
        unit: UnitId,
        expected: UnitId,
        recomputed: UnitId,
    },
    #[error("witnessed level mismatch for {unit}: expected {expected}, recomputed {recomputed}")]
    WitnessedLevelMismatch {
        unit: UnitId,
        expected: u64,
        recomputed: u64,
    },
    #[error("latest included mc index could not be determined for {0}")]
    LimciUnresolved(UnitId),
    #[error("ball of parent {parent} missing while stabilizing {unit}")]
    MissingParentBall { unit: UnitId, parent: UnitId },
    #[error("main-chain unit at mci {0} missing")]
    MissingMcUnit(u64),
    #[error("consensus invariant violated: {0}")]
    Invariant(String),
}

/// Historical units that must win best-tip selection whenever they are free.
///
/// This is a one-time compatibility shim for networks that once had to
/// counter an adversarial main-chain retreat; it is consulted only when
/// choosing the best free unit and is empty on fresh networks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetreatOverrides {
    /// Version tag of the table, logged when an override fires
    pub version: u32,
    units: Vec<UnitId>,
}

impl RetreatOverrides {
    pub fn new(version: u32, units: Vec<UnitId>) -> Self {
        RetreatOverrides { version, units }
    }

    pub fn contains(&self, unit: &UnitId) -> bool {
        self.units.contains(unit)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
