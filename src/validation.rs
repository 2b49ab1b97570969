//! Unit validation.
//!
//! The consensus core only ever sees units a [`UnitValidator`] accepted.
//! Validation runs against a read view of the [`ConsensusState`]; the result
//! of an accepted unit is a [`ValidationState`] the engine applies under the
//! write lock.

use serde::{Deserialize, Serialize};

use crate::consensus::graph::{is_included, is_included_or_equal};
use crate::consensus::state::{ConsensusState, UnitIdx};
use crate::consensus::{conflict, limci, main_chain, witness};
use crate::consensus::{Address, Sequence, Unit, UnitId};
use crate::constants::{MAX_AUTHORS_PER_UNIT, MAX_INPUTS_PER_UNIT, MAX_PARENTS_PER_UNIT};

/// Reasons a unit is refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unit id does not match content")]
    WrongUnitHash,
    #[error("genesis units cannot be submitted")]
    Genesis,
    #[error("too many parents (max {})", MAX_PARENTS_PER_UNIT)]
    TooManyParents,
    #[error("parents not sorted or not unique")]
    UnsortedParents,
    #[error("unit has no authors")]
    NoAuthors,
    #[error("too many authors (max {})", MAX_AUTHORS_PER_UNIT)]
    TooManyAuthors,
    #[error("authors not sorted or not unique")]
    UnsortedAuthors,
    #[error("too many inputs (max {})", MAX_INPUTS_PER_UNIT)]
    TooManyInputs,
    #[error("output spent twice within the unit")]
    DuplicateInput,
    #[error("invalid witness list: {0}")]
    WitnessList(String),
    #[error("no last ball")]
    NoLastBall,
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("parent {0} is an ancestor of another parent")]
    RedundantParent(UnitId),
    #[error("witness list unit {0} is not stable")]
    WitnessListUnitNotStable(UnitId),
    #[error("witness list incompatible with best parent {0}")]
    IncompatibleWitnesses(UnitId),
    #[error("last ball unit {0} is not on the main chain")]
    LastBallNotOnMainChain(UnitId),
    #[error("last ball unit {0} is not included by the parents")]
    LastBallNotIncluded(UnitId),
    #[error("last ball unit {0} is not stable")]
    LastBallNotStable(UnitId),
    #[error("last ball does not match the ball of {0}")]
    LastBallMismatch(UnitId),
    #[error("last ball mci {own} retreats below parent's {parent}")]
    LastBallRetreat { own: u64, parent: u64 },
    #[error("witnessed level {own} retreats below best parent's {parent}")]
    WitnessedLevelRetreat { own: u64, parent: u64 },
    #[error("spent output of unit {0} not included by the parents")]
    InputNotIncluded(UnitId),
    #[error("internal: {0}")]
    Internal(String),
}

/// Everything the engine needs to write an accepted unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationState {
    pub level: u64,
    pub max_parent_limci: Option<u64>,
    pub last_ball_mci: u64,
    pub witnessed_level: u64,
    pub best_parent_unit: UnitId,
    pub sequence: Sequence,
    /// Authors that have a unit the new one does not include
    pub addresses_with_forked_path: Vec<Address>,
    /// Unstable good units to flip to temp-bad when the unit is written
    pub conflicting_units: Vec<UnitId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accept(ValidationState),
    /// The unit is invalid; its id may be remembered as bad
    UnitError(ValidationError),
    /// The envelope is invalid; the id proves nothing about the unit
    JointError(ValidationError),
    NeedParentUnits(Vec<UnitId>),
    NeedHashTree,
}

pub trait UnitValidator: Send + Sync {
    fn validate(&self, unit: &Unit, state: &ConsensusState) -> ValidationOutcome;
}

/// Pass/fail oracle for author signatures.
pub trait Authentifier: Send + Sync {
    fn authenticate(&self, unit: &Unit) -> Result<(), String>;
}

/// Accepts every author. For simulations and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustAuthors;

impl Authentifier for TrustAuthors {
    fn authenticate(&self, _unit: &Unit) -> Result<(), String> {
        Ok(())
    }
}

/// Last-ball MCIs from which version-gated rules apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeSchedule {
    /// From here on the last ball unit must be stable in view of the parents
    pub last_ball_stable_in_parents_mci: u64,
    /// From here on the witnessed level may not drop below the best parent's
    pub witnessed_level_must_not_retreat_mci: u64,
}

impl UpgradeSchedule {
    /// Cutoffs of the historical main network.
    pub fn legacy_mainnet() -> Self {
        UpgradeSchedule {
            last_ball_stable_in_parents_mci: crate::constants::LEGACY_LAST_BALL_STABLE_IN_PARENTS_MCI,
            witnessed_level_must_not_retreat_mci:
                crate::constants::LEGACY_WITNESSED_LEVEL_MUST_NOT_RETREAT_MCI,
        }
    }
}

/// Structural and DAG checks shipped with the crate.
#[derive(Clone, Debug, Default)]
pub struct BasicValidator<A = TrustAuthors> {
    authentifier: A,
    upgrades: UpgradeSchedule,
}

impl<A: Authentifier> BasicValidator<A> {
    pub fn new(authentifier: A, upgrades: UpgradeSchedule) -> Self {
        BasicValidator {
            authentifier,
            upgrades,
        }
    }

    pub fn upgrades(&self) -> &UpgradeSchedule {
        &self.upgrades
    }

    fn check_shape(&self, unit: &Unit) -> Result<(), ValidationError> {
        if unit.is_genesis() {
            return Err(ValidationError::Genesis);
        }
        if unit.parent_units.len() > MAX_PARENTS_PER_UNIT {
            return Err(ValidationError::TooManyParents);
        }
        if unit.parent_units.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ValidationError::UnsortedParents);
        }
        if unit.authors.is_empty() {
            return Err(ValidationError::NoAuthors);
        }
        if unit.authors.len() > MAX_AUTHORS_PER_UNIT {
            return Err(ValidationError::TooManyAuthors);
        }
        if unit.authors.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ValidationError::UnsortedAuthors);
        }
        if unit.inputs.len() > MAX_INPUTS_PER_UNIT {
            return Err(ValidationError::TooManyInputs);
        }
        let mut seen = std::collections::HashSet::new();
        if !unit.inputs.iter().all(|i| seen.insert(*i)) {
            return Err(ValidationError::DuplicateInput);
        }
        match (&unit.witnesses, &unit.witness_list_unit) {
            (Some(list), None) => {
                witness::check_witness_list_shape(list).map_err(ValidationError::WitnessList)?
            }
            (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(ValidationError::WitnessList(
                    "both inline witnesses and witness list unit".into(),
                ))
            }
            (None, None) => return Err(ValidationError::WitnessList("no witnesses".into())),
        }
        if unit.last_ball.is_none() || unit.last_ball_unit.is_none() {
            return Err(ValidationError::NoLastBall);
        }
        Ok(())
    }

    /// Checks that need every referenced unit to be known.
    fn check_against_dag(
        &self,
        unit: &Unit,
        state: &ConsensusState,
    ) -> Result<ValidationState, ValidationError> {
        let parents = known(state, &unit.parent_units)?;

        for &p in &parents {
            let others: Vec<UnitIdx> = parents.iter().copied().filter(|&o| o != p).collect();
            if !others.is_empty() && is_included(state, p, &others) {
                return Err(ValidationError::RedundantParent(state.get(p).id()));
            }
        }

        if let Some(wlu) = &unit.witness_list_unit {
            let wlu_idx = known(state, std::slice::from_ref(wlu))?[0];
            if !state.props(wlu_idx).is_stable {
                return Err(ValidationError::WitnessListUnitNotStable(*wlu));
            }
        }
        let witnesses = state
            .resolve_witnesses(unit)
            .map_err(ValidationError::WitnessList)?;

        let best_parent = main_chain::determine_best_parent(state, &parents)
            .ok_or_else(|| ValidationError::Internal("no best parent".into()))?;
        let best_parent_id = state.get(best_parent).id();
        if !witness::is_compatible_witness_list(&witnesses, &state.get(best_parent).witnesses) {
            return Err(ValidationError::IncompatibleWitnesses(best_parent_id));
        }

        let last_ball_mci = self.check_last_ball(unit, state, &parents)?;

        let witnessed_level = witness::witnessed_level_from(state, best_parent, &witnesses)
            .map_err(|e| ValidationError::Internal(e.to_string()))?;
        let parent_wl = state.props(best_parent).witnessed_level;
        if last_ball_mci >= self.upgrades.witnessed_level_must_not_retreat_mci
            && witnessed_level < parent_wl
        {
            return Err(ValidationError::WitnessedLevelRetreat {
                own: witnessed_level,
                parent: parent_wl,
            });
        }

        for input in &unit.inputs {
            let source = state
                .idx(&input.unit)
                .ok_or(ValidationError::InputNotIncluded(input.unit))?;
            if !is_included_or_equal(state, source, &parents) {
                return Err(ValidationError::InputNotIncluded(input.unit));
            }
        }

        let level = parents
            .iter()
            .map(|&p| state.props(p).level)
            .max()
            .unwrap_or(0)
            + 1;
        let max_parent_limci = limci::max_parent_limci(state, &parents);

        let mut sequence = Sequence::Good;
        let mut addresses_with_forked_path = Vec::new();
        let mut conflicting_units = Vec::new();
        for author in &unit.authors {
            let conflicts =
                conflict::find_conflicting_units(state, author, &parents, max_parent_limci);
            if conflicts.is_empty() {
                continue;
            }
            addresses_with_forked_path.push(*author);
            for c in conflicts {
                let props = state.props(c);
                if props.is_stable {
                    if props.sequence == Sequence::Good {
                        sequence = Sequence::FinalBad;
                    }
                } else if props.sequence == Sequence::Good {
                    conflicting_units.push(state.get(c).id());
                }
            }
            if sequence == Sequence::Good {
                sequence = Sequence::TempBad;
            }
        }
        if sequence != Sequence::Good {
            tracing::debug!(
                unit = %unit.id,
                %sequence,
                conflicts = conflicting_units.len(),
                "Nonserial unit"
            );
        }

        Ok(ValidationState {
            level,
            max_parent_limci,
            last_ball_mci,
            witnessed_level,
            best_parent_unit: best_parent_id,
            sequence,
            addresses_with_forked_path,
            conflicting_units,
        })
    }

    /// Returns the last ball MCI.
    fn check_last_ball(
        &self,
        unit: &Unit,
        state: &ConsensusState,
        parents: &[UnitIdx],
    ) -> Result<u64, ValidationError> {
        let (Some(last_ball), Some(lbu)) = (&unit.last_ball, &unit.last_ball_unit) else {
            return Err(ValidationError::NoLastBall);
        };
        let lbu_idx = known(state, std::slice::from_ref(lbu))?[0];
        let props = state.props(lbu_idx);
        if !is_included_or_equal(state, lbu_idx, parents) {
            return Err(ValidationError::LastBallNotIncluded(*lbu));
        }
        // The engine advances stability up to the last ball before validating
        // when the parents prove it stable, so an unstable one here is invalid.
        if !props.is_stable {
            return Err(ValidationError::LastBallNotStable(*lbu));
        }
        let last_ball_mci = match (props.is_on_main_chain, props.main_chain_index) {
            (true, Some(mci)) => mci,
            _ => return Err(ValidationError::LastBallNotOnMainChain(*lbu)),
        };
        if props.ball.as_ref() != Some(last_ball) {
            return Err(ValidationError::LastBallMismatch(*lbu));
        }

        for &p in parents {
            let parent_lb_mci = parent_last_ball_mci(state, p);
            if last_ball_mci < parent_lb_mci {
                return Err(ValidationError::LastBallRetreat {
                    own: last_ball_mci,
                    parent: parent_lb_mci,
                });
            }
        }
        Ok(last_ball_mci)
    }
}

impl<A: Authentifier> UnitValidator for BasicValidator<A> {
    fn validate(&self, unit: &Unit, state: &ConsensusState) -> ValidationOutcome {
        if unit.content_id() != unit.id {
            return ValidationOutcome::JointError(ValidationError::WrongUnitHash);
        }
        if let Err(e) = self.check_shape(unit) {
            return ValidationOutcome::UnitError(e);
        }
        let missing: Vec<UnitId> = unit
            .references()
            .into_iter()
            .filter(|r| !state.contains(r))
            .collect();
        if !missing.is_empty() {
            return ValidationOutcome::NeedParentUnits(missing);
        }
        if let Err(reason) = self.authentifier.authenticate(unit) {
            return ValidationOutcome::UnitError(ValidationError::Authentication(reason));
        }
        match self.check_against_dag(unit, state) {
            Ok(vs) => ValidationOutcome::Accept(vs),
            Err(e) => ValidationOutcome::UnitError(e),
        }
    }
}

fn known(state: &ConsensusState, ids: &[UnitId]) -> Result<Vec<UnitIdx>, ValidationError> {
    ids.iter()
        .map(|id| {
            state
                .idx(id)
                .ok_or_else(|| ValidationError::Internal(format!("unit {id} not known")))
        })
        .collect()
}

/// MCI of the last ball a stored unit referenced; genesis counts as 0.
pub fn parent_last_ball_mci(state: &ConsensusState, parent: UnitIdx) -> u64 {
    state
        .get(parent)
        .unit
        .last_ball_unit
        .and_then(|lbu| state.get_by_id(&lbu))
        .and_then(|r| r.props.main_chain_index)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::test_support::*;
    use crate::consensus::{OutputRef, UnitBuilder, UnitProps};

    fn validator() -> BasicValidator {
        BasicValidator::default()
    }

    /// A unit on `parents` with genesis as last ball and witness list unit.
    fn unit_on(state: &ConsensusState, parents: &[UnitIdx], author: Address, nonce: u64) -> Unit {
        builder_on(state, parents, author, nonce).build()
    }

    fn builder_on(
        state: &ConsensusState,
        parents: &[UnitIdx],
        author: Address,
        nonce: u64,
    ) -> UnitBuilder {
        let g = state.get(state.genesis());
        UnitBuilder::new()
            .parents(parents.iter().map(|&p| state.get(p).id()))
            .last_ball(g.props.ball.unwrap(), g.id())
            .witness_list_unit(g.id())
            .author(author)
            .timestamp(nonce)
    }

    fn unit_error(outcome: ValidationOutcome) -> ValidationError {
        match outcome {
            ValidationOutcome::UnitError(e) => e,
            other => panic!("expected unit error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_simple_child_of_genesis() {
        let state = genesis_state();
        let unit = unit_on(&state, &[state.genesis()], user_addr(1), 1);
        match validator().validate(&unit, &state) {
            ValidationOutcome::Accept(vs) => {
                assert_eq!(vs.level, 1);
                assert_eq!(vs.witnessed_level, 0);
                assert_eq!(vs.last_ball_mci, 0);
                assert_eq!(vs.best_parent_unit, state.get(state.genesis()).id());
                assert_eq!(vs.sequence, Sequence::Good);
                assert!(vs.conflicting_units.is_empty());
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn tampered_id_is_a_joint_error() {
        let state = genesis_state();
        let mut unit = unit_on(&state, &[state.genesis()], user_addr(1), 1);
        unit.timestamp += 1;
        assert_eq!(
            validator().validate(&unit, &state),
            ValidationOutcome::JointError(ValidationError::WrongUnitHash)
        );
    }

    #[test]
    fn unknown_parent_needs_parent_units() {
        let state = genesis_state();
        let g = state.get(state.genesis());
        let missing = UnitId([5; 32]);
        let unit = UnitBuilder::new()
            .parents([g.id(), missing])
            .last_ball(g.props.ball.unwrap(), g.id())
            .witness_list_unit(g.id())
            .author(user_addr(1))
            .build();
        assert_eq!(
            validator().validate(&unit, &state),
            ValidationOutcome::NeedParentUnits(vec![missing])
        );
    }

    #[test]
    fn missing_last_ball_is_rejected() {
        let state = genesis_state();
        let g = state.get(state.genesis());
        let unit = UnitBuilder::new()
            .parents([g.id()])
            .witness_list_unit(g.id())
            .author(user_addr(1))
            .build();
        assert_eq!(unit_error(validator().validate(&unit, &state)), ValidationError::NoLastBall);
    }

    #[test]
    fn wrong_last_ball_is_rejected() {
        let state = genesis_state();
        let g = state.get(state.genesis());
        let unit = UnitBuilder::new()
            .parents([g.id()])
            .last_ball(crate::consensus::BallId([1; 32]), g.id())
            .witness_list_unit(g.id())
            .author(user_addr(1))
            .build();
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::LastBallMismatch(g.id())
        );
    }

    #[test]
    fn redundant_parent_is_rejected() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let unit = unit_on(&state, &[g, a], user_addr(2), 2);
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::RedundantParent(state.get(g).id())
        );
    }

    #[test]
    fn unstable_last_ball_unit_is_rejected() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let genesis_id = state.get(g).id();
        let unit = UnitBuilder::new()
            .parents([state.get(a).id()])
            .last_ball(crate::consensus::BallId([1; 32]), state.get(a).id())
            .witness_list_unit(genesis_id)
            .author(user_addr(2))
            .build();
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::LastBallNotStable(state.get(a).id())
        );
    }

    #[test]
    fn inline_witness_list_must_have_right_size() {
        let state = genesis_state();
        let g = state.get(state.genesis());
        let unit = UnitBuilder::new()
            .parents([g.id()])
            .last_ball(g.props.ball.unwrap(), g.id())
            .witnesses(witness_list().into_iter().take(5))
            .author(user_addr(1))
            .build();
        assert!(matches!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::WitnessList(_)
        ));
    }

    #[test]
    fn witness_list_differing_in_two_places_is_incompatible() {
        let state = genesis_state();
        let g = state.get(state.genesis());
        let mut list = witness_list();
        list[0] = user_addr(1);
        list[1] = user_addr(2);
        let unit = UnitBuilder::new()
            .parents([g.id()])
            .last_ball(g.props.ball.unwrap(), g.id())
            .witnesses(list)
            .author(user_addr(3))
            .build();
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::IncompatibleWitnesses(g.id())
        );
    }

    #[test]
    fn spending_output_not_included_is_rejected() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let b = add(&mut state, &[g], user_addr(2), 2);
        let unit = builder_on(&state, &[b], user_addr(3), 3)
            .spend(OutputRef {
                unit: state.get(a).id(),
                message_index: 0,
                output_index: 0,
            })
            .build();
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::InputNotIncluded(state.get(a).id())
        );
    }

    #[test]
    fn authentifier_can_refuse() {
        struct Refuse;
        impl Authentifier for Refuse {
            fn authenticate(&self, _unit: &Unit) -> Result<(), String> {
                Err("bad signature".into())
            }
        }
        let state = genesis_state();
        let unit = unit_on(&state, &[state.genesis()], user_addr(1), 1);
        let validator = BasicValidator::new(Refuse, UpgradeSchedule::default());
        assert_eq!(
            unit_error(validator.validate(&unit, &state)),
            ValidationError::Authentication("bad signature".into())
        );
    }

    #[test]
    fn concurrent_unit_by_same_author_is_temp_bad() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        let b = add(&mut state, &[g], user_addr(2), 2);
        let unit = unit_on(&state, &[b], user_addr(1), 3);
        match validator().validate(&unit, &state) {
            ValidationOutcome::Accept(vs) => {
                assert_eq!(vs.sequence, Sequence::TempBad);
                assert_eq!(vs.addresses_with_forked_path, vec![user_addr(1)]);
                assert_eq!(vs.conflicting_units, vec![state.get(a).id()]);
            }
            other => panic!("expected accept, got {other:?}"),
        }
        // including the earlier unit makes it serial
        let serial = unit_on(&state, &[a, b], user_addr(1), 4);
        match validator().validate(&serial, &state) {
            ValidationOutcome::Accept(vs) => assert_eq!(vs.sequence, Sequence::Good),
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn conflict_with_stable_good_unit_is_final_bad() {
        let mut state = genesis_state();
        let g = state.genesis();
        let a = add(&mut state, &[g], user_addr(1), 1);
        witness_chain(&mut state, a, 20, 0);
        assert!(state.props(a).is_stable);
        // a side branch from genesis that ignores `a`
        let side = add(&mut state, &[g], user_addr(2), 2);
        let unit = unit_on(&state, &[side], user_addr(1), 3);
        match validator().validate(&unit, &state) {
            ValidationOutcome::Accept(vs) => {
                assert_eq!(vs.sequence, Sequence::FinalBad);
                assert!(vs.conflicting_units.is_empty());
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn witnessed_level_may_not_retreat_below_best_parent() {
        let mut state = genesis_state();
        let g = state.genesis();
        // witnesses 0..=6 on levels 1..=7, then witness 6 again on 8..=10
        let mut tip = *witness_chain(&mut state, g, 7, 0).last().unwrap();
        for nonce in 0..3 {
            tip = add(&mut state, &[tip], witness_addr(6), 100 + nonce);
        }
        assert_eq!(state.props(tip).witnessed_level, 1);

        // dropping witness 6 leaves only six witnesses above genesis
        let mut list = witness_list();
        list[6] = user_addr(200);
        list.sort();
        let genesis = state.get(g);
        let unit = UnitBuilder::new()
            .parents([state.get(tip).id()])
            .last_ball(genesis.props.ball.unwrap(), genesis.id())
            .witnesses(list)
            .author(user_addr(3))
            .build();
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::WitnessedLevelRetreat { own: 0, parent: 1 }
        );

        let gated = BasicValidator::new(
            TrustAuthors,
            UpgradeSchedule {
                witnessed_level_must_not_retreat_mci: 1,
                ..UpgradeSchedule::default()
            },
        );
        assert!(matches!(gated.validate(&unit, &state), ValidationOutcome::Accept(_)));
    }

    #[test]
    fn last_ball_may_not_retreat_below_a_parent() {
        let mut state = genesis_state();
        let g = state.genesis();
        let chain = witness_chain(&mut state, g, 20, 0);
        let tip = chain[19];
        let anchor = chain[2];
        assert!(state.props(anchor).is_stable);
        assert_eq!(state.props(anchor).main_chain_index, Some(3));

        // a parent that already references the ball at mci 3
        let genesis_id = state.get(g).id();
        let parent = UnitBuilder::new()
            .parents([state.get(tip).id()])
            .last_ball(state.props(anchor).ball.unwrap(), state.get(anchor).id())
            .witness_list_unit(genesis_id)
            .author(user_addr(1))
            .timestamp(1)
            .build();
        let witnesses = state.resolve_witnesses(&parent).unwrap();
        let props = UnitProps {
            level: 21,
            witnessed_level: state.props(tip).witnessed_level,
            best_parent: Some(state.get(tip).id()),
            is_free: true,
            ..UnitProps::default()
        };
        let parent = state.insert(parent, props, witnesses).unwrap();
        assert_eq!(parent_last_ball_mci(&state, parent), 3);

        let unit = unit_on(&state, &[parent], user_addr(2), 2);
        assert_eq!(
            unit_error(validator().validate(&unit, &state)),
            ValidationError::LastBallRetreat { own: 0, parent: 3 }
        );
    }

    #[test]
    fn legacy_schedule_carries_historical_cutoffs() {
        let legacy = UpgradeSchedule::legacy_mainnet();
        assert_eq!(legacy.last_ball_stable_in_parents_mci, 1_300_000);
        assert_eq!(legacy.witnessed_level_must_not_retreat_mci, 1_400_000);
        assert_eq!(UpgradeSchedule::default().last_ball_stable_in_parents_mci, 0);
    }
}
