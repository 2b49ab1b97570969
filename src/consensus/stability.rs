//! Stability of main-chain indices.
//!
//! The first unstable main-chain unit becomes stable once the witness-backed
//! level reached by the current main chain is at least as high as the level
//! of anything a competing branch could still push past it. Stabilizing an
//! MCI freezes its units, resolves their conflicts and assigns their balls.

use std::collections::HashSet;

use super::ball::{ball_hash, skiplist_mcis, BallId};
use super::graph::is_included_or_equal;
use super::main_chain::tip_order;
use super::state::{ConsensusState, UnitIdx};
use super::unit::{Address, Sequence, UnitId};
use super::witness::{count_common_witnesses, min_witnessed_level_on_chain};
use super::{conflict, ConsensusError};
use crate::constants::{COUNT_WITNESSES, MAX_WITNESS_LIST_MUTATIONS};

/// Answer to "is this unit stable in the view of these later units?"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StabilityCheck {
    Stable,
    NotYetStable,
}

/// An MCI that just became stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilizedMci {
    pub mci: u64,
    /// Units at this MCI that ended up final-bad
    pub final_bad: Vec<UnitId>,
}

/// Advance the stability point as far as the current DAG allows.
pub fn advance_stability(state: &mut ConsensusState) -> Result<Vec<StabilizedMci>, ConsensusError> {
    let mut stabilized = Vec::new();
    while let Some(mci) = next_stable_mci(state)? {
        stabilized.push(mark_mci_stable(state, mci)?);
    }
    Ok(stabilized)
}

/// The MCI right after the stability point, if it is now stable.
fn next_stable_mci(state: &ConsensusState) -> Result<Option<u64>, ConsensusError> {
    let last_stable_mci = state.last_stable_mci();
    let last_stable = state
        .mc_unit_at(last_stable_mci)
        .ok_or(ConsensusError::MissingMcUnit(last_stable_mci))?;
    let last_stable_record = state.get(last_stable);

    let best_children = best_children_of(state, last_stable);
    if best_children.is_empty() {
        if last_stable_record.props.is_free {
            return Ok(None);
        }
        return Err(ConsensusError::NotSingleMcChild(last_stable_record.id()));
    }
    let (mc_children, alt_roots): (Vec<UnitIdx>, Vec<UnitIdx>) = best_children
        .into_iter()
        .partition(|&c| state.props(c).is_on_main_chain);
    let first_unstable = match mc_children.as_slice() {
        [only] => *only,
        _ => return Err(ConsensusError::NotSingleMcChild(last_stable_record.id())),
    };
    let first_props = state.props(first_unstable);
    let candidate_mci = last_stable_mci + 1;
    if first_props.main_chain_index != Some(candidate_mci) {
        return Err(ConsensusError::Invariant(format!(
            "first unstable main-chain unit {} has mci {:?}, expected {}",
            state.get(first_unstable).id(),
            first_props.main_chain_index,
            candidate_mci
        )));
    }

    let tip = main_chain_tip(state)?;
    let witnesses = &last_stable_record.witnesses;
    let stable = is_stable_against(state, tip, witnesses, first_props.level, &alt_roots, |_| true)?;
    Ok(stable.then_some(candidate_mci))
}

/// The single free main-chain unit.
fn main_chain_tip(state: &ConsensusState) -> Result<UnitIdx, ConsensusError> {
    let tips: Vec<UnitIdx> = state
        .free_units()
        .filter(|&u| state.props(u).is_on_main_chain)
        .collect();
    match tips.as_slice() {
        [only] => Ok(*only),
        _ => Err(ConsensusError::NotSingleMcTip(tips.len())),
    }
}

/// Children of `parent` that picked it as their best parent.
fn best_children_of(state: &ConsensusState, parent: UnitIdx) -> Vec<UnitIdx> {
    state
        .get(parent)
        .children()
        .iter()
        .copied()
        .filter(|&c| state.get(c).best_parent() == Some(parent))
        .collect()
}

/// All units reachable from `roots` through best-child links, restricted to
/// units accepted by `filter`.
fn best_children_tree(
    state: &ConsensusState,
    roots: &[UnitIdx],
    filter: impl Fn(UnitIdx) -> bool,
) -> Vec<UnitIdx> {
    let mut seen: HashSet<UnitIdx> = roots.iter().copied().collect();
    let mut out = roots.to_vec();
    let mut stack = roots.to_vec();
    while let Some(idx) = stack.pop() {
        for child in best_children_of(state, idx) {
            if filter(child) && seen.insert(child) {
                out.push(child);
                stack.push(child);
            }
        }
    }
    out
}

/// Highest level among alternative-branch units that raised the witnessed
/// level over all their parents and use a compatible witness list.
fn max_alt_level(state: &ConsensusState, alt_units: &[UnitIdx], witnesses: &[Address]) -> Option<u64> {
    alt_units
        .iter()
        .copied()
        .filter(|&u| {
            let record = state.get(u);
            let wl = record.props.witnessed_level;
            record
                .parents()
                .iter()
                .all(|&p| state.props(p).witnessed_level < wl)
                && count_common_witnesses(&record.witnesses, witnesses)
                    >= COUNT_WITNESSES - MAX_WITNESS_LIST_MUTATIONS
        })
        .map(|u| state.props(u).level)
        .max()
}

/// The stability predicate shared by the global check and the check in the
/// view of later units.
///
/// `candidate_level` is the level of the main-chain unit being tested and
/// `alt_roots` the competing best children of its best parent.
fn is_stable_against(
    state: &ConsensusState,
    tip: UnitIdx,
    witnesses: &[Address],
    candidate_level: u64,
    alt_roots: &[UnitIdx],
    filter: impl Fn(UnitIdx) -> bool,
) -> Result<bool, ConsensusError> {
    let Some(min_mc_wl) = min_witnessed_level_on_chain(state, tip, witnesses)? else {
        return Ok(false);
    };
    if alt_roots.is_empty() {
        return Ok(min_mc_wl >= candidate_level);
    }
    let alt_units = best_children_tree(state, alt_roots, filter);
    let max_alt = max_alt_level(state, &alt_units, witnesses).unwrap_or(candidate_level);
    Ok(min_mc_wl >= max_alt)
}

/// Freeze every unit at `mci`, settle their conflicts and assign balls.
pub fn mark_mci_stable(state: &mut ConsensusState, mci: u64) -> Result<StabilizedMci, ConsensusError> {
    if mci != state.last_stable_mci() + 1 {
        return Err(ConsensusError::Invariant(format!(
            "cannot stabilize mci {} after {}",
            mci,
            state.last_stable_mci()
        )));
    }
    let units = state.units_at_mci(mci);
    if units.is_empty() {
        return Err(ConsensusError::MissingMcUnit(mci));
    }
    for &idx in &units {
        state.set_stable(idx);
    }

    let final_bad = conflict::resolve_mci(state, mci)?;
    assign_balls(state, mci)?;
    state.set_last_stable_mci(mci);

    tracing::debug!(
        mci,
        units = units.len(),
        final_bad = final_bad.len(),
        "Main chain index became stable"
    );
    Ok(StabilizedMci { mci, final_bad })
}

fn assign_balls(state: &mut ConsensusState, mci: u64) -> Result<(), ConsensusError> {
    let mut units = state.units_at_mci(mci);
    units.sort_by_key(|&idx| (state.props(idx).level, state.get(idx).id()));

    for idx in units {
        let record = state.get(idx);
        let id = record.id();
        if record.props.ball.is_some() {
            return Err(ConsensusError::Invariant(format!("unit {} already has a ball", id)));
        }
        let mut parent_balls: Vec<BallId> = Vec::with_capacity(record.parents().len());
        for &parent in record.parents() {
            let ball = state
                .props(parent)
                .ball
                .ok_or_else(|| ConsensusError::MissingParentBall {
                    unit: id,
                    parent: state.get(parent).id(),
                })?;
            parent_balls.push(ball);
        }

        let mut skiplist_units: Vec<UnitId> = Vec::new();
        let mut skiplist_balls: Vec<BallId> = Vec::new();
        if record.props.is_on_main_chain {
            for target in skiplist_mcis(mci) {
                let mc_unit = state
                    .mc_unit_at(target)
                    .ok_or(ConsensusError::MissingMcUnit(target))?;
                let ball = state.props(mc_unit).ball.ok_or_else(|| {
                    ConsensusError::Invariant(format!("stable main-chain unit at mci {} has no ball", target))
                })?;
                skiplist_units.push(state.get(mc_unit).id());
                skiplist_balls.push(ball);
            }
        }

        let is_final_bad = record.props.sequence == Sequence::FinalBad;
        let content_hash = is_final_bad.then(|| record.unit.content_hash());
        let ball = ball_hash(&id, &parent_balls, &skiplist_balls, is_final_bad);

        state.set_ball(idx, ball);
        let record = state.record_mut(idx);
        record.props.skiplist = skiplist_units;
        if content_hash.is_some() {
            record.props.content_hash = content_hash;
        }
    }
    Ok(())
}

/// Whether `earlier` is stable in the view of a node that knows only the
/// ancestors of `later`.
///
/// Uses the same predicate as the global stability check, but builds the
/// main chain from the best of `later` and only counts competing branches
/// that `later` includes.
pub fn is_stable_in_later_units(
    state: &ConsensusState,
    earlier: UnitIdx,
    later: &[UnitIdx],
) -> Result<StabilityCheck, ConsensusError> {
    if state.is_genesis(earlier) || state.props(earlier).is_stable {
        return Ok(StabilityCheck::Stable);
    }
    is_stable_in_view_of(state, earlier, later)
}

/// The view-restricted stability predicate alone, ignoring what this node
/// already knows to be stable. Composers use it to pick a last ball every
/// node that has the parents will accept.
pub fn is_stable_in_view_of(
    state: &ConsensusState,
    earlier: UnitIdx,
    later: &[UnitIdx],
) -> Result<StabilityCheck, ConsensusError> {
    let props = state.props(earlier);
    if state.is_genesis(earlier) {
        return Ok(StabilityCheck::Stable);
    }
    if later.is_empty() || props.is_free || !is_included_or_equal(state, earlier, later) {
        return Ok(StabilityCheck::NotYetStable);
    }

    let later_tip = later
        .iter()
        .copied()
        .min_by(|&a, &b| tip_order(state, a, b))
        .ok_or(ConsensusError::NoFreeUnits)?;

    // `earlier` must lie on the best-parent chain of the later tip.
    let mut current = later_tip;
    while state.props(current).level > props.level {
        let record = state.get(current);
        current = record
            .best_parent()
            .ok_or(ConsensusError::NoBestParent(record.id()))?;
    }
    if current != earlier {
        return Ok(StabilityCheck::NotYetStable);
    }

    let record = state.get(earlier);
    let best_parent = record
        .best_parent()
        .ok_or(ConsensusError::NoBestParent(record.id()))?;
    let witnesses = &state.get(best_parent).witnesses;
    let included_by_later = |u: UnitIdx| is_included_or_equal(state, u, later);
    let alt_roots: Vec<UnitIdx> = best_children_of(state, best_parent)
        .into_iter()
        .filter(|&c| c != earlier && included_by_later(c))
        .collect();

    let stable = is_stable_against(
        state,
        later_tip,
        witnesses,
        props.level,
        &alt_roots,
        included_by_later,
    )?;
    Ok(if stable {
        StabilityCheck::Stable
    } else {
        StabilityCheck::NotYetStable
    })
}

/// Like [`is_stable_in_later_units`], but when the answer is `Stable`
/// also marks every MCI up to `earlier`'s as stable.
pub fn determine_if_stable_in_later_units_and_advance(
    state: &mut ConsensusState,
    earlier: UnitIdx,
    later: &[UnitIdx],
) -> Result<(StabilityCheck, Vec<StabilizedMci>), ConsensusError> {
    let check = is_stable_in_later_units(state, earlier, later)?;
    if check == StabilityCheck::NotYetStable || state.props(earlier).is_stable {
        return Ok((check, Vec::new()));
    }
    let props = state.props(earlier);
    let mci = match (props.is_on_main_chain, props.main_chain_index) {
        (true, Some(mci)) => mci,
        _ => {
            return Err(ConsensusError::Invariant(format!(
                "unit {} is stable in later units but not on the main chain",
                state.get(earlier).id()
            )))
        }
    };
    let mut stabilized = Vec::new();
    while state.last_stable_mci() < mci {
        let next = state.last_stable_mci() + 1;
        stabilized.push(mark_mci_stable(state, next)?);
    }
    stabilized.extend(advance_stability(state)?);
    Ok((check, stabilized))
}
