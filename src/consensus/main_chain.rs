//! Main chain selection.
//!
//! The main chain is the best-parent path from the best free unit down to
//! genesis. When a new unit moves the best tip, the path is rebuilt from the
//! tip down to the first unit that was already on the main chain, and every
//! unit above that rejoin point gets a fresh main-chain index.

use std::cmp::Ordering;

use super::state::{ConsensusState, UnitIdx};
use super::{ConsensusError, RetreatOverrides};

/// Total order used for both best-parent and best-tip selection.
///
/// Better units sort first: higher witnessed level, then lower
/// `level - witnessed_level`, then lower unit id.
pub fn tip_order(state: &ConsensusState, a: UnitIdx, b: UnitIdx) -> Ordering {
    let pa = state.props(a);
    let pb = state.props(b);
    pb.witnessed_level
        .cmp(&pa.witnessed_level)
        .then_with(|| {
            let da = pa.level.saturating_sub(pa.witnessed_level);
            let db = pb.level.saturating_sub(pb.witnessed_level);
            da.cmp(&db)
        })
        .then_with(|| state.get(a).id().cmp(&state.get(b).id()))
}

/// Best parent among `parents`, or `None` if there are none.
pub fn determine_best_parent(state: &ConsensusState, parents: &[UnitIdx]) -> Option<UnitIdx> {
    parents
        .iter()
        .copied()
        .min_by(|&a, &b| tip_order(state, a, b))
}

/// Free units, best first.
pub fn sorted_free_units(state: &ConsensusState) -> Vec<UnitIdx> {
    let mut free: Vec<UnitIdx> = state.free_units().collect();
    free.sort_by(|&a, &b| tip_order(state, a, b));
    free
}

/// Pick the unit the main chain is built from.
pub fn select_best_tip(
    state: &ConsensusState,
    overrides: &RetreatOverrides,
) -> Result<UnitIdx, ConsensusError> {
    let free = sorted_free_units(state);
    let best = *free.first().ok_or(ConsensusError::NoFreeUnits)?;
    if free.len() > 1 && !overrides.is_empty() {
        if let Some(&forced) = free.iter().find(|&&u| overrides.contains(&state.get(u).id())) {
            if forced != best {
                tracing::info!(
                    unit = %state.get(forced).id(),
                    instead_of = %state.get(best).id(),
                    version = overrides.version,
                    "Retreat override selected best tip"
                );
            }
            return Ok(forced);
        }
    }
    Ok(best)
}

/// Outcome of one main-chain update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McUpdate {
    /// MCI of the unit where the new path rejoined the old main chain.
    /// Everything above it was re-indexed.
    pub last_mci: u64,
    pub tip: UnitIdx,
    /// Units that joined the main chain, lowest first
    pub new_mc_units: Vec<UnitIdx>,
    /// Whether previously indexed main-chain units were pushed off
    pub rebuilt: bool,
}

/// Rebuild the main chain after a unit was appended.
pub fn update_main_chain(
    state: &mut ConsensusState,
    overrides: &RetreatOverrides,
) -> Result<McUpdate, ConsensusError> {
    let tip = select_best_tip(state, overrides)?;

    // Walk down best parents until we meet the old main chain.
    let mut path: Vec<UnitIdx> = Vec::new();
    let mut current = tip;
    let last_mci = loop {
        let record = state.get(current);
        if record.props.is_on_main_chain {
            break record.props.main_chain_index.ok_or_else(|| {
                ConsensusError::Invariant(format!(
                    "main-chain unit {} has no index",
                    record.id()
                ))
            })?;
        }
        if path.len() >= state.len() {
            return Err(ConsensusError::Invariant(
                "best-parent walk revisited a unit".into(),
            ));
        }
        path.push(current);
        current = record
            .best_parent()
            .ok_or(ConsensusError::NoBestParent(record.id()))?;
    };

    let above = state.units_above_mci(last_mci);
    for &idx in above.iter().chain(path.iter()) {
        if state.props(idx).is_stable {
            return Err(ConsensusError::RebuildBelowStable {
                unit: state.get(idx).id(),
                rejoin_mci: last_mci,
            });
        }
    }

    let mut rebuilt = false;
    for &idx in &above {
        if state.props(idx).is_on_main_chain {
            rebuilt = true;
            state.record_mut(idx).props.is_on_main_chain = false;
        }
        state.set_main_chain_index(idx, None);
    }
    for &idx in &path {
        state.record_mut(idx).props.is_on_main_chain = true;
        state.set_main_chain_index(idx, None);
    }

    path.reverse();
    let mut mci = last_mci;
    for &mc_unit in &path {
        mci += 1;
        state.set_main_chain_index(mc_unit, Some(mci));
        let mut stack = vec![mc_unit];
        while let Some(idx) = stack.pop() {
            let parents = state.get(idx).parents().to_vec();
            for parent in parents {
                if state.props(parent).main_chain_index.is_none() {
                    state.set_main_chain_index(parent, Some(mci));
                    stack.push(parent);
                }
            }
        }
    }

    if rebuilt {
        tracing::debug!(
            rejoin_mci = last_mci,
            new_tip = %state.get(tip).id(),
            new_length = mci,
            "Main chain rebuilt"
        );
    }

    Ok(McUpdate {
        last_mci,
        tip,
        new_mc_units: path,
        rebuilt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::test_support::*;
    use crate::consensus::Sequence;

    fn assert_contiguous(state: &ConsensusState) {
        let max = state.max_mci().unwrap();
        for mci in 0..=max {
            assert!(state.mc_unit_at(mci).is_some(), "no main-chain unit at {mci}");
        }
    }

    /// Two children of genesis; returns (on main chain, off main chain).
    fn fork(state: &mut ConsensusState) -> (UnitIdx, UnitIdx) {
        let g = state.genesis();
        let a = add(state, &[g], user_addr(1), 1);
        let b = add(state, &[g], user_addr(2), 2);
        if state.props(a).is_on_main_chain {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[test]
    fn chain_gets_consecutive_indices() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 10, 0);
        for (i, &u) in chain.iter().enumerate() {
            let props = state.props(u);
            assert!(props.is_on_main_chain);
            assert_eq!(props.main_chain_index, Some(i as u64 + 1));
        }
        assert_contiguous(&state);
    }

    #[test]
    fn best_parent_prefers_lower_id_on_tie() {
        let mut state = genesis_state();
        let (winner, loser) = fork(&mut state);
        assert!(state.get(winner).id() < state.get(loser).id());
        assert_eq!(determine_best_parent(&state, &[loser, winner]), Some(winner));
        assert_eq!(determine_best_parent(&state, &[]), None);
        assert_eq!(state.props(loser).main_chain_index, None);
    }

    #[test]
    fn side_units_share_index_of_including_mc_unit() {
        let mut state = genesis_state();
        let (winner, loser) = fork(&mut state);
        let merge = add(&mut state, &[winner, loser], user_addr(3), 3);
        assert_eq!(state.props(merge).main_chain_index, Some(2));
        assert_eq!(state.props(loser).main_chain_index, Some(2));
        assert!(!state.props(loser).is_on_main_chain);
        assert_contiguous(&state);
    }

    #[test]
    fn higher_witnessed_level_branch_takes_over() {
        let mut state = genesis_state();
        let (winner, loser) = fork(&mut state);
        let branch = witness_chain(&mut state, loser, 10, 0);
        let tip = *branch.last().unwrap();

        assert!(state.props(tip).is_on_main_chain);
        assert!(state.props(loser).is_on_main_chain);
        assert_eq!(state.props(loser).main_chain_index, Some(1));
        assert!(!state.props(winner).is_on_main_chain);
        assert_eq!(state.props(winner).main_chain_index, None);
        assert_eq!(state.props(tip).main_chain_index, Some(11));
        assert_contiguous(&state);
    }

    #[test]
    fn rebuild_below_stable_is_fatal() {
        let mut state = genesis_state();
        let (winner, loser) = fork(&mut state);
        state.set_stable(winner);

        let mut tip = loser;
        let mut result = Ok(());
        for i in 0..10 {
            let w = witness_addr(i);
            tip = insert_unit(&mut state, &[tip], w, 100 + i as u64, Sequence::Good, vec![]);
            if let Err(e) = update_main_chain(&mut state, &RetreatOverrides::default()) {
                result = Err(e);
                break;
            }
        }
        assert!(matches!(
            result,
            Err(ConsensusError::RebuildBelowStable { rejoin_mci: 0, .. })
        ));
    }

    #[test]
    fn retreat_override_wins_tip_selection() {
        let mut state = genesis_state();
        let (winner, loser) = fork(&mut state);
        assert_eq!(
            select_best_tip(&state, &RetreatOverrides::default()).unwrap(),
            winner
        );
        let overrides = RetreatOverrides::new(1, vec![state.get(loser).id()]);
        assert_eq!(select_best_tip(&state, &overrides).unwrap(), loser);

        let update = update_main_chain(&mut state, &overrides).unwrap();
        assert!(update.rebuilt);
        assert_eq!(update.last_mci, 0);
        assert_eq!(update.new_mc_units, vec![loser]);
        assert!(state.props(loser).is_on_main_chain);
        assert!(!state.props(winner).is_on_main_chain);
    }

    #[test]
    fn unchanged_tip_is_a_no_op() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let update = update_main_chain(&mut state, &RetreatOverrides::default()).unwrap();
        assert_eq!(update.tip, a);
        assert_eq!(update.last_mci, 1);
        assert!(update.new_mc_units.is_empty());
        assert!(!update.rebuilt);
    }
}
