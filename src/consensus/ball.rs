//! Balls and skiplists.
//!
//! A ball is the stability-time fingerprint of a unit. It commits to the unit,
//! the balls of all its parents, the balls of its skiplist targets and whether
//! the unit ended up final-bad. Anyone holding those inputs can recompute it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::unit::UnitId;
use crate::constants::SKIPLIST_BASE;

/// Ball identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BallId(pub crate::Hash);

impl fmt::Display for BallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for BallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BallId({})", self)
    }
}

/// Compute the ball of a unit.
///
/// Parent and skiplist balls are sorted here, so the result does not depend on
/// the order the caller collected them in.
pub fn ball_hash(
    unit: &UnitId,
    parent_balls: &[BallId],
    skiplist_balls: &[BallId],
    is_final_bad: bool,
) -> BallId {
    let mut parents = parent_balls.to_vec();
    parents.sort();
    let mut skiplist = skiplist_balls.to_vec();
    skiplist.sort();

    let mut hasher = blake3::Hasher::new_derive_key("trellis.ball");
    hasher.update(&unit.0);
    hasher.update(&(parents.len() as u64).to_le_bytes());
    for ball in &parents {
        hasher.update(&ball.0);
    }
    hasher.update(&(skiplist.len() as u64).to_le_bytes());
    for ball in &skiplist {
        hasher.update(&ball.0);
    }
    hasher.update(&[is_final_bad as u8]);
    BallId(*hasher.finalize().as_bytes())
}

/// Check a claimed ball against its inputs.
pub fn verify_ball(
    claimed: &BallId,
    unit: &UnitId,
    parent_balls: &[BallId],
    skiplist_balls: &[BallId],
    is_final_bad: bool,
) -> bool {
    ball_hash(unit, parent_balls, skiplist_balls, is_final_bad) == *claimed
}

/// Main-chain indices a main-chain unit at `mci` links back to.
///
/// For every `k >= 1` with `mci % 10^k == 0` the target is `mci - 10^k`.
/// MCI 0 has no skiplist.
pub fn skiplist_mcis(mci: u64) -> Vec<u64> {
    let mut targets = Vec::new();
    if mci == 0 {
        return targets;
    }
    let mut divisor = SKIPLIST_BASE;
    while mci % divisor == 0 {
        targets.push(mci - divisor);
        match divisor.checked_mul(SKIPLIST_BASE) {
            Some(next) if next <= mci => divisor = next,
            _ => break,
        }
    }
    targets
}
