//! Whole-state consistency checks.
//!
//! These walk every record and are meant for tests, the simulator and
//! offline verification of a store, not for the write path.

use std::collections::{BTreeMap, HashMap};

use super::ball::verify_ball;
use super::graph::are_concurrent;
use super::state::{ConsensusState, UnitIdx};
use super::unit::{Address, Sequence};

/// Summary of a state that passed every check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub units: usize,
    pub max_mci: u64,
    pub last_stable_mci: u64,
    pub verified_balls: usize,
    pub good: usize,
    pub temp_bad: usize,
    pub final_bad: usize,
}

/// Run every check.
pub fn audit(state: &ConsensusState) -> Result<AuditReport, String> {
    let max_mci = check_main_chain(state)?;
    check_limci(state)?;
    let verified_balls = check_balls(state)?;
    check_conflicts(state)?;

    let mut report = AuditReport {
        units: state.len(),
        max_mci,
        last_stable_mci: state.last_stable_mci(),
        verified_balls,
        ..AuditReport::default()
    };
    for (_, record) in state.iter() {
        match record.props.sequence {
            Sequence::Good => report.good += 1,
            Sequence::TempBad => report.temp_bad += 1,
            Sequence::FinalBad => report.final_bad += 1,
        }
    }
    Ok(report)
}

/// Main-chain indices form `0..=max` with exactly one main-chain unit each.
/// Returns `max`.
pub fn check_main_chain(state: &ConsensusState) -> Result<u64, String> {
    let mut on_mc: BTreeMap<u64, usize> = BTreeMap::new();
    let mut max_assigned = 0;
    for (_, record) in state.iter() {
        let props = &record.props;
        if let Some(mci) = props.main_chain_index {
            max_assigned = max_assigned.max(mci);
        }
        if props.is_on_main_chain {
            let mci = props
                .main_chain_index
                .ok_or_else(|| format!("main-chain unit {} has no mci", record.id()))?;
            *on_mc.entry(mci).or_default() += 1;
        }
    }
    for (expected, (&mci, &count)) in on_mc.iter().enumerate() {
        if mci != expected as u64 {
            return Err(format!("main chain has a gap before mci {mci}"));
        }
        if count != 1 {
            return Err(format!("{count} main-chain units at mci {mci}"));
        }
    }
    let max = on_mc.keys().next_back().copied().unwrap_or(0);
    if max_assigned > max {
        return Err(format!("mci {max_assigned} assigned above the main chain tip {max}"));
    }
    Ok(max)
}

/// LIMCI never decreases from parent to child and covers main-chain parents.
pub fn check_limci(state: &ConsensusState) -> Result<(), String> {
    for (idx, record) in state.iter() {
        if state.is_genesis(idx) {
            continue;
        }
        let limci = record
            .props
            .latest_included_mc_index
            .ok_or_else(|| format!("unit {} has no limci", record.id()))?;
        for &parent in record.parents() {
            let p = state.props(parent);
            if p.latest_included_mc_index.is_some_and(|pl| pl > limci) {
                return Err(format!("limci of {} below its parent's", record.id()));
            }
            if p.is_on_main_chain && p.main_chain_index.is_some_and(|m| m > limci) {
                return Err(format!(
                    "limci of {} below main-chain parent's mci",
                    record.id()
                ));
            }
        }
    }
    Ok(())
}

/// Every stable unit has a ball that recomputes from stored inputs; no
/// unstable unit has one. Returns the number of verified balls.
pub fn check_balls(state: &ConsensusState) -> Result<usize, String> {
    let ids: HashMap<_, UnitIdx> = state.iter().map(|(idx, r)| (r.id(), idx)).collect();
    let mut verified = 0;
    for (_, record) in state.iter() {
        let props = &record.props;
        let Some(ball) = props.ball else {
            if props.is_stable {
                return Err(format!("stable unit {} has no ball", record.id()));
            }
            continue;
        };
        if !props.is_stable {
            return Err(format!("unstable unit {} has a ball", record.id()));
        }
        let ball_of = |idx: UnitIdx| {
            state
                .props(idx)
                .ball
                .ok_or_else(|| format!("unit {} has no ball", state.get(idx).id()))
        };
        let parent_balls = record
            .parents()
            .iter()
            .map(|&p| ball_of(p))
            .collect::<Result<Vec<_>, _>>()?;
        let skiplist_balls = props
            .skiplist
            .iter()
            .map(|id| {
                ids.get(id)
                    .copied()
                    .ok_or_else(|| format!("skiplist unit {id} unknown"))
                    .and_then(ball_of)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let final_bad = props.sequence == Sequence::FinalBad;
        if !verify_ball(&ball, &record.id(), &parent_balls, &skiplist_balls, final_bad) {
            return Err(format!("ball of {} does not verify", record.id()));
        }
        verified += 1;
    }
    Ok(verified)
}

/// No two concurrent stable units by one author are both good.
pub fn check_conflicts(state: &ConsensusState) -> Result<(), String> {
    let mut by_author: HashMap<Address, Vec<UnitIdx>> = HashMap::new();
    for (idx, record) in state.iter() {
        if record.props.is_stable && record.props.sequence == Sequence::Good {
            for author in &record.unit.authors {
                by_author.entry(*author).or_default().push(idx);
            }
        }
    }
    for (author, units) in by_author {
        for (i, &a) in units.iter().enumerate() {
            for &b in &units[i + 1..] {
                if are_concurrent(state, a, b) {
                    return Err(format!(
                        "concurrent good units {} and {} by {}",
                        state.get(a).id(),
                        state.get(b).id(),
                        author
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::test_support::*;

    #[test]
    fn witness_chain_passes_audit() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 30, 0);
        add(&mut state, &[chain[25]], user_addr(1), 1);
        let report = audit(&state).unwrap();
        assert_eq!(report.units, 32);
        assert_eq!(report.max_mci, 30);
        assert!(report.last_stable_mci > 10);
        assert_eq!(report.verified_balls as u64, report.last_stable_mci + 1);
        assert_eq!(report.final_bad, 0);
    }

    #[test]
    fn detects_tampered_ball() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 20, 0);
        state.record_mut(chain[0]).props.ball = Some(crate::consensus::BallId([1; 32]));
        assert!(check_balls(&state).is_err());
    }

    #[test]
    fn detects_second_main_chain_unit() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let b = add(&mut state, &[g], user_addr(2), 2);
        let off_mc = if state.props(a).is_on_main_chain { b } else { a };
        state.set_main_chain_index(off_mc, Some(1));
        state.record_mut(off_mc).props.is_on_main_chain = true;
        assert!(check_main_chain(&state).is_err());
    }
}
