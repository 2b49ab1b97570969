//! Ancestry queries over the parent relation.
//!
//! Parent edges never change once a unit exists, so these answers are stable
//! for the lifetime of the units involved. Cached props (`level`, MCI, LIMCI)
//! settle most questions without a traversal; the traversal that remains is
//! pruned by level and MCI.

use std::collections::HashSet;

use super::state::{ConsensusState, UnitIdx};

/// Relation of a unit `a` to a unit `b`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// `a` is an ancestor of `b`
    Before,
    /// `a` is a descendant of `b`
    After,
    Equal,
    /// Neither includes the other
    Concurrent,
}

/// True iff `earlier` equals one of `later` or is an ancestor of any of them.
pub fn is_included_or_equal(state: &ConsensusState, earlier: UnitIdx, later: &[UnitIdx]) -> bool {
    if later.contains(&earlier) {
        return true;
    }
    is_included(state, earlier, later)
}

/// True iff `earlier` is a strict ancestor of any unit in `later`.
pub fn is_included(state: &ConsensusState, earlier: UnitIdx, later: &[UnitIdx]) -> bool {
    if later.is_empty() {
        return false;
    }
    if state.is_genesis(earlier) {
        return later.iter().any(|&l| l != earlier);
    }
    let e = state.props(earlier);
    if e.is_free {
        return false;
    }
    let max_later_limci = later
        .iter()
        .filter_map(|&l| state.props(l).latest_included_mc_index)
        .max();
    if let (Some(e_mci), Some(limci)) = (e.main_chain_index, max_later_limci) {
        if limci >= e_mci {
            return true;
        }
    }
    let max_later_level = later
        .iter()
        .map(|&l| state.props(l).level)
        .max()
        .unwrap_or(0);
    if max_later_level <= e.level {
        return false;
    }

    let mut visited: HashSet<UnitIdx> = HashSet::new();
    let mut stack: Vec<UnitIdx> = later.to_vec();
    while let Some(current) = stack.pop() {
        for &parent in state.get(current).parents() {
            if parent == earlier {
                return true;
            }
            if !visited.insert(parent) {
                continue;
            }
            let p = state.props(parent);
            if p.level <= e.level {
                continue;
            }
            // MCI never decreases along parent -> child
            if let (Some(p_mci), Some(e_mci)) = (p.main_chain_index, e.main_chain_index) {
                if p_mci < e_mci {
                    continue;
                }
            }
            stack.push(parent);
        }
    }
    false
}

/// Decide how `a` relates to `b`, using cached props before traversing.
pub fn compare_by_props(state: &ConsensusState, a: UnitIdx, b: UnitIdx) -> Relation {
    if a == b {
        return Relation::Equal;
    }
    let pa = state.props(a);
    let pb = state.props(b);
    if pa.level == pb.level {
        return Relation::Concurrent;
    }
    if pa.is_free && pb.is_free {
        return Relation::Concurrent;
    }
    if state.is_genesis(a) {
        return Relation::Before;
    }
    if state.is_genesis(b) {
        return Relation::After;
    }
    if let (Some(limci_a), Some(mci_b)) = (pa.latest_included_mc_index, pb.main_chain_index) {
        if limci_a >= mci_b {
            return Relation::After;
        }
    }
    if let (Some(limci_b), Some(mci_a)) = (pb.latest_included_mc_index, pa.main_chain_index) {
        if limci_b >= mci_a {
            return Relation::Before;
        }
    }

    let (earlier, later, if_included) = if pa.level < pb.level {
        (a, b, Relation::Before)
    } else {
        (b, a, Relation::After)
    };
    let pe = state.props(earlier);
    let pl = state.props(later);
    let limci_ok = match (pe.latest_included_mc_index, pl.latest_included_mc_index) {
        (Some(le), Some(ll)) => ll >= le,
        (Some(_), None) => false,
        _ => true,
    };
    let mci_ok = match (pe.main_chain_index, pl.main_chain_index) {
        (Some(me), Some(ml)) => ml >= me,
        _ => true,
    };
    if !limci_ok || !mci_ok {
        return Relation::Concurrent;
    }
    if is_included(state, earlier, &[later]) {
        if_included
    } else {
        Relation::Concurrent
    }
}

/// Whether two units are mutually non-ancestral.
pub fn are_concurrent(state: &ConsensusState, a: UnitIdx, b: UnitIdx) -> bool {
    compare_by_props(state, a, b) == Relation::Concurrent
}
