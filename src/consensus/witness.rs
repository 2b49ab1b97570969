//! Witnessed levels.
//!
//! Walking down from a unit's best parent along best-parent links, collect
//! distinct authors that belong to the unit's witness list. The level of the
//! unit at which a majority of witnesses has been collected is the witnessed
//! level. Reaching genesis first yields 0.

use std::collections::BTreeSet;

use super::state::{ConsensusState, UnitIdx};
use super::unit::Address;
use super::ConsensusError;
use crate::constants::{COUNT_WITNESSES, MAJORITY_OF_WITNESSES, MAX_WITNESS_LIST_MUTATIONS};

/// Witnessed level of a unit whose best parent is `best_parent`.
pub fn witnessed_level_from(
    state: &ConsensusState,
    best_parent: UnitIdx,
    witnesses: &[Address],
) -> Result<u64, ConsensusError> {
    let mut collected: BTreeSet<Address> = BTreeSet::new();
    let mut current = best_parent;
    loop {
        let record = state.get(current);
        if record.props.level == 0 {
            return Ok(0);
        }
        for author in &record.unit.authors {
            if witnesses.contains(author) {
                collected.insert(*author);
            }
        }
        if collected.len() >= MAJORITY_OF_WITNESSES {
            return Ok(record.props.level);
        }
        current = record
            .best_parent()
            .ok_or(ConsensusError::NoBestParent(record.id()))?;
    }
}

/// Minimum witnessed level among witness-authored units on the best-parent
/// chain from `tip` down to the unit where a majority of distinct witnesses
/// has been collected.
///
/// This is the witness-backed level the chain ending at `tip` has reached.
/// Returns `None` when the walk reaches genesis without meeting a single
/// witness-authored unit.
pub fn min_witnessed_level_on_chain(
    state: &ConsensusState,
    tip: UnitIdx,
    witnesses: &[Address],
) -> Result<Option<u64>, ConsensusError> {
    let mut collected: BTreeSet<Address> = BTreeSet::new();
    let mut min_wl: Option<u64> = None;
    let mut current = tip;
    loop {
        let record = state.get(current);
        for author in &record.unit.authors {
            if witnesses.contains(author) {
                collected.insert(*author);
            }
        }
        if record.witness_author_count(witnesses) > 0 {
            let wl = record.props.witnessed_level;
            min_wl = Some(min_wl.map_or(wl, |m: u64| m.min(wl)));
        }
        if collected.len() >= MAJORITY_OF_WITNESSES || record.props.level == 0 {
            return Ok(min_wl);
        }
        current = record
            .best_parent()
            .ok_or(ConsensusError::NoBestParent(record.id()))?;
    }
}

/// Number of addresses shared by two witness lists.
pub fn count_common_witnesses(a: &[Address], b: &[Address]) -> usize {
    a.iter().filter(|w| b.contains(w)).count()
}

/// Whether `list` may be used by a unit whose best parent uses `reference`.
pub fn is_compatible_witness_list(list: &[Address], reference: &[Address]) -> bool {
    count_common_witnesses(list, reference) >= COUNT_WITNESSES - MAX_WITNESS_LIST_MUTATIONS
}

/// Check the shape of an inline witness list: right size, sorted, unique.
pub fn check_witness_list_shape(list: &[Address]) -> Result<(), String> {
    if list.len() != COUNT_WITNESSES {
        return Err(format!(
            "wrong number of witnesses: {} instead of {}",
            list.len(),
            COUNT_WITNESSES
        ));
    }
    if list.windows(2).any(|w| w[0] >= w[1]) {
        return Err("witnesses not sorted or not unique".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::test_support::*;

    #[test]
    fn witnessed_level_is_zero_until_majority_collected() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 8, 0);
        // units 1..=7 only see genesis or fewer than 7 distinct witnesses below them
        for &u in &chain[..7] {
            assert_eq!(state.props(u).witnessed_level, 0);
        }
        // unit 8 collects witnesses 0..=6 from units at levels 7..=1
        assert_eq!(state.props(chain[7]).witnessed_level, 1);
    }

    #[test]
    fn witnessed_level_grows_with_chain() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 30, 0);
        for (i, &u) in chain.iter().enumerate() {
            let level = i as u64 + 1;
            assert_eq!(state.props(u).level, level);
            assert_eq!(state.props(u).witnessed_level, level.saturating_sub(7));
        }
    }

    #[test]
    fn non_witness_authors_do_not_count() {
        let mut state = genesis_state();
        let g = state.genesis();
        let mut tip = g;
        for i in 0..20 {
            tip = add(&mut state, &[tip], user_addr(1), i);
        }
        assert_eq!(state.props(tip).witnessed_level, 0);
    }

    #[test]
    fn min_witnessed_level_on_chain_stops_at_majority() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 30, 0);
        let tip = *chain.last().unwrap();
        // levels 30..=24 carry seven distinct witnesses; the lowest wl among them is 17
        let min = min_witnessed_level_on_chain(&state, tip, &witness_list()).unwrap();
        assert_eq!(min, Some(17));
    }

    #[test]
    fn min_witnessed_level_on_chain_counts_repeated_witness_once() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 20, 0);
        // the same witness authors the top two units, so the walk needs one more level
        let top = add(&mut state, &[chain[19]], witness_addr(7), 100);
        let tip = add(&mut state, &[top], witness_addr(7), 101);
        assert_eq!(state.props(tip).level, 22);
        let min = min_witnessed_level_on_chain(&state, tip, &witness_list()).unwrap();
        // distinct witnesses 7, 6, 5, 4, 3, 2, 1 end at level 14 with wl 7
        assert_eq!(min, Some(7));
    }

    #[test]
    fn min_witnessed_level_on_short_chain_reaches_genesis() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 3, 0);
        let min = min_witnessed_level_on_chain(&state, chain[2], &witness_list()).unwrap();
        assert_eq!(min, Some(0));
    }

    #[test]
    fn witness_list_compatibility() {
        let list = witness_list();
        let mut mutated = list.clone();
        mutated[0] = user_addr(200);
        mutated.sort();
        assert!(is_compatible_witness_list(&mutated, &list));
        let mut twice = mutated.clone();
        twice[1] = user_addr(201);
        twice.sort();
        assert!(!is_compatible_witness_list(&twice, &list));
    }

    #[test]
    fn witness_list_shape() {
        assert!(check_witness_list_shape(&witness_list()).is_ok());
        assert!(check_witness_list_shape(&witness_list()[..11]).is_err());
        let mut unsorted = witness_list();
        unsorted.swap(0, 1);
        assert!(check_witness_list_shape(&unsorted).is_err());
    }
}
