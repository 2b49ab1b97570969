//! Conflict resolution between units of the same author.
//!
//! Two units by the same address that do not include one another are
//! conflicting. While they are unstable the later arrival is marked
//! `TempBad`; once its MCI is stable the decision becomes final: a temp-bad
//! unit that conflicts with a stable good unit becomes `FinalBad`, otherwise
//! it is reinstated as `Good`. Units spending outputs of a final-bad unit are
//! final-bad as well.

use std::collections::{BTreeSet, VecDeque};

use super::graph::{compare_by_props, is_included_or_equal, Relation};
use super::state::{ConsensusState, UnitIdx};
use super::unit::{Address, Sequence, UnitId};
use super::ConsensusError;

/// Existing units by `author` that a new unit with these `parents` would
/// conflict with.
///
/// Units with an MCI at or below `max_parent_limci` are included through
/// the main chain and skipped without a traversal.
pub fn find_conflicting_units(
    state: &ConsensusState,
    author: &Address,
    parents: &[UnitIdx],
    max_parent_limci: Option<u64>,
) -> Vec<UnitIdx> {
    state
        .units_by_author(author)
        .iter()
        .copied()
        .filter(|&other| {
            if let (Some(mci), Some(limci)) = (state.props(other).main_chain_index, max_parent_limci) {
                if mci <= limci {
                    return false;
                }
            }
            !is_included_or_equal(state, other, parents)
        })
        .collect()
}

/// Stable good units by any author of `idx` that are concurrent with it
/// and sit in the MCI window `(limci, mci]` of `idx`.
pub fn find_stable_conflicting_units(state: &ConsensusState, idx: UnitIdx) -> Vec<UnitIdx> {
    let props = state.props(idx);
    let mut found = BTreeSet::new();
    for author in &state.get(idx).unit.authors {
        for &other in state.units_by_author(author) {
            if other == idx {
                continue;
            }
            let other_props = state.props(other);
            if !other_props.is_stable || other_props.sequence != Sequence::Good {
                continue;
            }
            let Some(other_mci) = other_props.main_chain_index else {
                continue;
            };
            if props.latest_included_mc_index.is_some_and(|limci| other_mci <= limci) {
                continue;
            }
            if props.main_chain_index.is_some_and(|mci| other_mci > mci) {
                continue;
            }
            if compare_by_props(state, other, idx) == Relation::Concurrent {
                found.insert(other);
            }
        }
    }
    found.into_iter().collect()
}

/// Settle the sequence of every temp-bad unit at a freshly stable `mci`.
///
/// Units are processed in ascending id order and each decision is visible
/// to the next, so of two temp-bad conflicting units the lower id wins.
/// Returns the units at `mci` that end up final-bad, in id order. Spenders
/// marked at a later MCI are returned when that MCI becomes stable.
pub fn resolve_mci(state: &mut ConsensusState, mci: u64) -> Result<Vec<UnitId>, ConsensusError> {
    let mut units = state.units_at_mci(mci);
    units.sort_by_key(|&idx| state.get(idx).id());

    for &idx in &units {
        if state.props(idx).sequence != Sequence::TempBad {
            continue;
        }
        let conflicts = find_stable_conflicting_units(state, idx);
        if conflicts.is_empty() {
            state.record_mut(idx).props.sequence = Sequence::Good;
        } else {
            tracing::debug!(
                unit = %state.get(idx).id(),
                conflicts = conflicts.len(),
                "Temp-bad unit finalized as bad"
            );
            state.record_mut(idx).props.sequence = Sequence::FinalBad;
        }
    }

    let seeds: Vec<UnitIdx> = units
        .iter()
        .copied()
        .filter(|&idx| state.props(idx).sequence == Sequence::FinalBad)
        .collect();
    propagate_final_bad(state, &seeds)?;
    Ok(units
        .into_iter()
        .filter(|&idx| state.props(idx).sequence == Sequence::FinalBad)
        .map(|idx| state.get(idx).id())
        .collect())
}

/// Mark every unit spending an output of a final-bad unit as final-bad,
/// transitively. Returns the newly marked units.
pub fn propagate_final_bad(
    state: &mut ConsensusState,
    seeds: &[UnitIdx],
) -> Result<Vec<UnitIdx>, ConsensusError> {
    let mut marked = Vec::new();
    let mut queue: VecDeque<UnitIdx> = seeds.iter().copied().collect();
    while let Some(idx) = queue.pop_front() {
        let id = state.get(idx).id();
        let spenders = state.spenders_of(&id).to_vec();
        for spender in spenders {
            let props = state.props(spender);
            if props.sequence == Sequence::FinalBad {
                continue;
            }
            if props.ball.is_some() {
                return Err(ConsensusError::Invariant(format!(
                    "unit {} spends final-bad {} but already has a ball",
                    state.get(spender).id(),
                    id
                )));
            }
            state.record_mut(spender).props.sequence = Sequence::FinalBad;
            marked.push(spender);
            queue.push_back(spender);
        }
    }
    Ok(marked)
}
