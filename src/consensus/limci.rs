//! Latest included main-chain index.
//!
//! A unit's LIMCI is the highest MCI among main-chain units it includes:
//! for each parent take the parent's own MCI when the parent is on the main
//! chain, otherwise the parent's LIMCI, and keep the maximum.

use std::collections::{HashMap, HashSet};

use super::state::{ConsensusState, UnitIdx};
use super::ConsensusError;

/// Recompute LIMCI for every unit whose MCI is unset or above `last_mci`.
///
/// Units are resolved in level order; a unit waits until all its affected
/// parents are resolved. Returns the number of records whose LIMCI changed.
pub fn update_latest_included_mc_index(
    state: &mut ConsensusState,
    last_mci: u64,
) -> Result<usize, ConsensusError> {
    let mut pending: Vec<UnitIdx> = state
        .unstable_units()
        .filter(|&idx| {
            !state.is_genesis(idx)
                && state
                    .props(idx)
                    .main_chain_index
                    .map_or(true, |mci| mci > last_mci)
        })
        .collect();
    pending.sort_by_key(|&idx| (state.props(idx).level, state.get(idx).id()));
    let affected: HashSet<UnitIdx> = pending.iter().copied().collect();

    let mut resolved: HashMap<UnitIdx, u64> = HashMap::with_capacity(pending.len());
    while !pending.is_empty() {
        let mut remaining = Vec::new();
        for &idx in &pending {
            match limci_from_parents(state, idx, &affected, &resolved) {
                Some(limci) => {
                    resolved.insert(idx, limci);
                }
                None => remaining.push(idx),
            }
        }
        if remaining.len() == pending.len() {
            return Err(ConsensusError::LimciUnresolved(state.get(remaining[0]).id()));
        }
        pending = remaining;
    }

    let mut changed = 0;
    let mut resolved: Vec<(UnitIdx, u64)> = resolved.into_iter().collect();
    resolved.sort();
    for (idx, limci) in resolved {
        if state.props(idx).latest_included_mc_index != Some(limci) {
            state.record_mut(idx).props.latest_included_mc_index = Some(limci);
            changed += 1;
        }
    }
    Ok(changed)
}

fn limci_from_parents(
    state: &ConsensusState,
    idx: UnitIdx,
    affected: &HashSet<UnitIdx>,
    resolved: &HashMap<UnitIdx, u64>,
) -> Option<u64> {
    let mut max: Option<u64> = None;
    for &parent in state.get(idx).parents() {
        let p = state.props(parent);
        let candidate = if p.is_on_main_chain {
            p.main_chain_index?
        } else if affected.contains(&parent) {
            *resolved.get(&parent)?
        } else {
            p.latest_included_mc_index?
        };
        max = Some(max.map_or(candidate, |m| m.max(candidate)));
    }
    max
}

/// Highest LIMCI-or-MCI contributed by a set of prospective parents.
///
/// This is the LIMCI a unit with these parents would get.
pub fn max_parent_limci(state: &ConsensusState, parents: &[UnitIdx]) -> Option<u64> {
    parents
        .iter()
        .filter_map(|&p| {
            let props = state.props(p);
            if props.is_on_main_chain {
                props.main_chain_index
            } else {
                props.latest_included_mc_index
            }
        })
        .max()
}
