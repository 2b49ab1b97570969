//! Consensus engine orchestration.
//!
//! [`Engine`] is the entry point for units arriving from any number of tasks.
//! Units sharing an author are validated one at a time under per-address
//! locks; every consensus update (insert, main chain, LIMCI, stability) runs
//! under the single global write lock and is persisted as one storage
//! transaction. A failed update rebuilds the in-memory state from storage.

use std::collections::VecDeque;

use tokio::sync::{broadcast, Mutex, RwLock};

use super::dependencies::{DependencyTracker, KnownBadUnit, UnhandledUnit};
use super::events::{ConsensusEvent, EventBus};
use super::locks::{LockKey, LockRegistry};
use super::storage::{ConsensusBatch, Storage, StorageError};
use crate::consensus::graph::is_included_or_equal;
use crate::consensus::stability::{self, StabilityCheck, StabilizedMci};
use crate::consensus::state::{ConsensusState, UnitIdx};
use crate::consensus::{
    limci, main_chain, witness, BallId, ConsensusError, RetreatOverrides, Sequence, Unit, UnitId,
    UnitProps,
};
use crate::validation::{UnitValidator, UpgradeSchedule, ValidationOutcome, ValidationState};

/// Engine errors. Both variants are fatal for the unit being processed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fatal consensus error: {0}")]
    Fatal(#[from] ConsensusError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What happened to a submitted unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    Accepted,
    /// Parked until these units arrive
    Pending(Vec<UnitId>),
    Rejected(String),
    AlreadyKnown,
    KnownBad(String),
    NeedHashTree,
}

/// Engine tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub retreat_overrides: RetreatOverrides,
    pub upgrades: UpgradeSchedule,
    pub lost_unit_timeout_ms: u64,
    pub unhandled_ttl_ms: u64,
    pub archive_depth: u64,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retreat_overrides: RetreatOverrides::default(),
            upgrades: UpgradeSchedule::default(),
            lost_unit_timeout_ms: crate::constants::LOST_UNIT_TIMEOUT_MS,
            unhandled_ttl_ms: crate::constants::UNHANDLED_TTL_MS,
            archive_depth: crate::constants::ARCHIVE_DEPTH,
            event_capacity: crate::constants::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// The consensus engine.
pub struct Engine<S: Storage, V: UnitValidator> {
    state: RwLock<ConsensusState>,
    storage: S,
    validator: V,
    locks: LockRegistry,
    tracker: Mutex<DependencyTracker>,
    events: EventBus,
    config: EngineConfig,
}

impl<S: Storage, V: UnitValidator> Engine<S, V> {
    /// Open the engine on `storage`, writing `genesis` if the store is empty.
    pub fn open(
        storage: S,
        validator: V,
        genesis: Unit,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let state = if storage.has_unit(&genesis.id)? {
            ConsensusState::load(&storage)?
        } else {
            if storage.last_stable_mci()?.is_some() {
                return Err(StorageError::Corrupted(format!(
                    "store was created from a genesis other than {}",
                    genesis.id
                ))
                .into());
            }
            let mut state = ConsensusState::new(genesis)?;
            let changes = state.take_changes();
            storage.apply_consensus_batch(&ConsensusBatch::from_changes(&state, &changes))?;
            tracing::info!(genesis = %state.get(state.genesis()).id(), "Initialized new DAG");
            state
        };
        let tracker = DependencyTracker::restore(storage.get_all_unhandled()?);
        tracing::info!(
            units = state.len(),
            last_stable_mci = state.last_stable_mci(),
            unhandled = tracker.len(),
            "Consensus engine opened"
        );
        Ok(Engine {
            state: RwLock::new(state),
            storage,
            validator,
            locks: LockRegistry::new(),
            tracker: Mutex::new(tracker),
            events: EventBus::new(config.event_capacity),
            config,
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Process a unit with no known origin.
    pub async fn handle_unit(&self, unit: Unit) -> Result<HandleOutcome, EngineError> {
        self.handle_unit_from(unit, None).await
    }

    /// Process a unit received from `peer`.
    ///
    /// Units that were waiting on it are processed afterwards, before this
    /// returns. The outcome is that of the submitted unit.
    pub async fn handle_unit_from(
        &self,
        unit: Unit,
        peer: Option<String>,
    ) -> Result<HandleOutcome, EngineError> {
        let id = unit.id;
        let outcome = self.process_unit(unit, peer).await?;
        self.clear_unhandled(&id, &outcome)?;
        if outcome == HandleOutcome::Accepted {
            let mut worklist = VecDeque::from([id]);
            while let Some(accepted) = worklist.pop_front() {
                for released in self.release_dependents(&accepted).await {
                    let released_id = released.unit.id;
                    // the stored record stays until the unit is handled
                    let result = self.process_unit(released.unit, released.peer).await?;
                    self.clear_unhandled(&released_id, &result)?;
                    tracing::debug!(unit = %released_id, outcome = ?result, "Processed released unit");
                    if result == HandleOutcome::Accepted {
                        worklist.push_back(released_id);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Drop the stored unhandled record of a unit that is no longer waiting.
    fn clear_unhandled(&self, id: &UnitId, outcome: &HandleOutcome) -> Result<(), EngineError> {
        if !matches!(outcome, HandleOutcome::Pending(_)) {
            self.storage.remove_unhandled(id)?;
        }
        Ok(())
    }

    async fn process_unit(
        &self,
        unit: Unit,
        peer: Option<String>,
    ) -> Result<HandleOutcome, EngineError> {
        let id = unit.id;
        if let Some(outcome) = self.quick_check(&id).await? {
            return Ok(outcome);
        }
        let _authors = self
            .locks
            .lock_many(unit.authors.iter().map(|a| LockKey::Address(*a)))
            .await;
        // Another task may have handled it while we waited.
        if let Some(outcome) = self.quick_check(&id).await? {
            return Ok(outcome);
        }

        loop {
            self.advance_for_last_ball(&unit).await?;
            let outcome = {
                let state = self.state.read().await;
                self.validator.validate(&unit, &state)
            };
            match outcome {
                ValidationOutcome::Accept(vs) => {
                    self.write_unit(unit, vs).await?;
                    return Ok(HandleOutcome::Accepted);
                }
                ValidationOutcome::NeedParentUnits(missing) => {
                    match self.park(&unit, missing, peer.clone()).await? {
                        Some(missing) => return Ok(HandleOutcome::Pending(missing)),
                        // everything arrived in the meantime
                        None => continue,
                    }
                }
                ValidationOutcome::UnitError(e) => {
                    let reason = e.to_string();
                    self.reject(&id, &reason).await?;
                    return Ok(HandleOutcome::Rejected(reason));
                }
                ValidationOutcome::JointError(e) => {
                    tracing::warn!(unit = %id, error = %e, "Rejected malformed joint");
                    return Ok(HandleOutcome::Rejected(e.to_string()));
                }
                ValidationOutcome::NeedHashTree => {
                    tracing::debug!(unit = %id, "Unit needs hash tree");
                    return Ok(HandleOutcome::NeedHashTree);
                }
            }
        }
    }

    async fn quick_check(&self, id: &UnitId) -> Result<Option<HandleOutcome>, EngineError> {
        let state = self.state.read().await;
        if state.contains(id) {
            return Ok(Some(HandleOutcome::AlreadyKnown));
        }
        if let Some(bad) = self.storage.get_known_bad(id)? {
            return Ok(Some(HandleOutcome::KnownBad(bad.reason)));
        }
        let mut tracker = self.tracker.lock().await;
        if let Some(waiting) = tracker.get(id) {
            let missing: Vec<UnitId> = waiting
                .missing
                .iter()
                .filter(|m| !state.contains(m))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Ok(Some(HandleOutcome::Pending(missing)));
            }
            // parked earlier and everything it waited for is known by now
            tracker.take(id);
        }
        Ok(None)
    }

    /// If the parents prove the last ball unit stable, advance stability up
    /// to it before validating.
    async fn advance_for_last_ball(&self, unit: &Unit) -> Result<(), EngineError> {
        let Some(lbu) = unit.last_ball_unit else {
            return Ok(());
        };
        let gate = self.config.upgrades.last_ball_stable_in_parents_mci;
        let needed = {
            let state = self.state.read().await;
            state.idx(&lbu).is_some_and(|idx| {
                let props = state.props(idx);
                !props.is_stable
                    && props.main_chain_index.is_some_and(|mci| mci >= gate)
                    && unit.parent_units.iter().all(|p| state.contains(p))
            })
        };
        if needed {
            self.advance_stable_in_later_units(&lbu, &unit.parent_units).await?;
        }
        Ok(())
    }

    async fn advance_stable_in_later_units(
        &self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<(), EngineError> {
        let _write = self.locks.lock(LockKey::Write).await;
        let mut state = self.state.write().await;
        let Some(earlier_idx) = state.idx(earlier) else {
            return Ok(());
        };
        let Some(later_idxs) = later.iter().map(|id| state.idx(id)).collect::<Option<Vec<_>>>()
        else {
            return Ok(());
        };
        let result =
            stability::determine_if_stable_in_later_units_and_advance(&mut state, earlier_idx, &later_idxs)
                .map(|(_, stabilized)| stabilized);
        let stabilized = self.settle(&mut state, earlier, result)?;
        self.commit(&mut state)?;
        drop(state);
        self.publish(&stabilized);
        Ok(())
    }

    async fn write_unit(&self, unit: Unit, vs: ValidationState) -> Result<(), EngineError> {
        let id = unit.id;
        let _write = self.locks.lock(LockKey::Write).await;
        let mut state = self.state.write().await;
        let result = apply_accepted_unit(&mut state, unit, &vs, &self.config.retreat_overrides);
        let stabilized = self.settle(&mut state, &id, result)?;
        self.commit(&mut state)?;
        drop(state);
        tracing::debug!(
            unit = %id,
            level = vs.level,
            witnessed_level = vs.witnessed_level,
            sequence = %vs.sequence,
            "Unit accepted"
        );
        self.publish(&stabilized);
        Ok(())
    }

    /// Turn a consensus failure into a rollback and a fatal error.
    fn settle<T>(
        &self,
        state: &mut ConsensusState,
        unit: &UnitId,
        result: Result<T, ConsensusError>,
    ) -> Result<T, EngineError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!(unit = %unit, error = %e, "Fatal consensus error");
                self.rollback(state)?;
                Err(EngineError::Fatal(e))
            }
        }
    }

    fn commit(&self, state: &mut ConsensusState) -> Result<(), EngineError> {
        let changes = state.take_changes();
        if changes.is_empty() {
            return Ok(());
        }
        let batch = ConsensusBatch::from_changes(state, &changes);
        if let Err(e) = self.storage.apply_consensus_batch(&batch) {
            tracing::error!(error = %e, "Failed to persist consensus update");
            self.rollback(state)?;
            return Err(e.into());
        }
        Ok(())
    }

    fn rollback(&self, state: &mut ConsensusState) -> Result<(), EngineError> {
        *state = ConsensusState::load(&self.storage)?;
        tracing::warn!(
            units = state.len(),
            last_stable_mci = state.last_stable_mci(),
            "Rolled back in-memory state to storage"
        );
        Ok(())
    }

    fn publish(&self, stabilized: &[StabilizedMci]) {
        for s in stabilized {
            tracing::info!(mci = s.mci, final_bad = s.final_bad.len(), "MCI became stable");
            self.events.emit(ConsensusEvent::MciBecameStable { mci: s.mci });
            for unit in &s.final_bad {
                self.events.emit(ConsensusEvent::UnitRejected {
                    unit: *unit,
                    reason: format!("final-bad at mci {}", s.mci),
                });
            }
        }
    }

    /// Record a unit with unknown dependencies. Returns `None` if they all
    /// became known before the unit could be parked.
    async fn park(
        &self,
        unit: &Unit,
        missing: Vec<UnitId>,
        peer: Option<String>,
    ) -> Result<Option<Vec<UnitId>>, EngineError> {
        let state = self.state.read().await;
        let mut tracker = self.tracker.lock().await;
        let missing: Vec<UnitId> = missing.into_iter().filter(|m| !state.contains(m)).collect();
        if missing.is_empty() {
            return Ok(None);
        }
        let record = UnhandledUnit {
            unit: unit.clone(),
            missing: missing.clone(),
            peer,
            received_at_ms: crate::now_ms(),
        };
        self.storage.put_unhandled(&record)?;
        tracker.record(record);
        tracing::debug!(unit = %unit.id, missing = missing.len(), "Unit waiting for dependencies");
        Ok(Some(missing))
    }

    async fn release_dependents(&self, id: &UnitId) -> Vec<UnhandledUnit> {
        let state = self.state.read().await;
        let mut tracker = self.tracker.lock().await;
        tracker.ready_units(id, |dep| state.contains(dep))
    }

    /// Remember `id` as bad and drop everything waiting on it.
    async fn reject(&self, id: &UnitId, reason: &str) -> Result<(), EngineError> {
        let now = crate::now_ms();
        self.storage.put_known_bad(
            id,
            &KnownBadUnit {
                reason: reason.to_string(),
                recorded_at_ms: now,
            },
        )?;
        tracing::warn!(unit = %id, reason, "Unit rejected");
        self.events.emit(ConsensusEvent::UnitRejected {
            unit: *id,
            reason: reason.to_string(),
        });

        let purged = self.tracker.lock().await.purge(id);
        for dependent in purged.iter().filter(|d| *d != id) {
            let reason = format!("depends on bad unit {id}");
            self.storage.remove_unhandled(dependent)?;
            self.storage.put_known_bad(
                dependent,
                &KnownBadUnit {
                    reason: reason.clone(),
                    recorded_at_ms: now,
                },
            )?;
            tracing::warn!(unit = %dependent, bad = %id, "Dependent of bad unit rejected");
            self.events.emit(ConsensusEvent::UnitRejected {
                unit: *dependent,
                reason,
            });
        }
        Ok(())
    }

    pub async fn unit(&self, id: &UnitId) -> Option<Unit> {
        self.state.read().await.get_by_id(id).map(|r| r.unit.clone())
    }

    pub async fn unit_props(&self, id: &UnitId) -> Option<UnitProps> {
        self.state.read().await.get_by_id(id).map(|r| r.props.clone())
    }

    pub async fn last_stable_mci(&self) -> u64 {
        self.state.read().await.last_stable_mci()
    }

    pub async fn ball_of(&self, id: &UnitId) -> Option<BallId> {
        self.state.read().await.get_by_id(id).and_then(|r| r.props.ball)
    }

    pub async fn unit_by_ball(&self, ball: &BallId) -> Option<UnitId> {
        let state = self.state.read().await;
        state.unit_by_ball(ball).map(|idx| state.get(idx).id())
    }

    pub async fn genesis_id(&self) -> UnitId {
        let state = self.state.read().await;
        state.get(state.genesis()).id()
    }

    /// Free units, best tip first.
    pub async fn free_units(&self) -> Vec<UnitId> {
        let state = self.state.read().await;
        main_chain::sorted_free_units(&state)
            .into_iter()
            .map(|idx| state.get(idx).id())
            .collect()
    }

    /// The most recent main-chain ball a unit on `parents` can use: stable
    /// here, included by the parents and stable in their view alone.
    pub async fn last_ball_for(&self, parents: &[UnitId]) -> Option<(BallId, UnitId)> {
        let state = self.state.read().await;
        let parents = parents
            .iter()
            .map(|id| state.idx(id))
            .collect::<Option<Vec<_>>>()?;
        let mut mci = state.last_stable_mci();
        loop {
            if let Some(mc) = state.mc_unit_at(mci) {
                let usable = is_included_or_equal(&state, mc, &parents)
                    && matches!(
                        stability::is_stable_in_view_of(&state, mc, &parents),
                        Ok(StabilityCheck::Stable)
                    );
                if usable {
                    let record = state.get(mc);
                    return record.props.ball.map(|ball| (ball, record.id()));
                }
            }
            mci = mci.checked_sub(1)?;
        }
    }

    /// Whether `earlier` is stable in view of `later`; when it is, stability
    /// is advanced up to it as a side effect.
    pub async fn is_stable_in_later_units(
        &self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<StabilityCheck, EngineError> {
        let (check, advance) = {
            let state = self.state.read().await;
            let Some(earlier_idx) = state.idx(earlier) else {
                return Ok(StabilityCheck::NotYetStable);
            };
            let Some(later_idxs) = later.iter().map(|id| state.idx(id)).collect::<Option<Vec<_>>>()
            else {
                return Ok(StabilityCheck::NotYetStable);
            };
            let check = stability::is_stable_in_later_units(&state, earlier_idx, &later_idxs)?;
            (
                check,
                check == StabilityCheck::Stable && !state.props(earlier_idx).is_stable,
            )
        };
        if advance {
            self.advance_stable_in_later_units(earlier, later).await?;
        }
        Ok(check)
    }

    /// Read-only access to the whole state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&ConsensusState) -> R) -> R {
        f(&*self.state.read().await)
    }

    pub async fn unhandled_count(&self) -> usize {
        self.tracker.lock().await.len()
    }

    /// Missing dependencies to request again from peers.
    pub async fn lost_units(&self, now_ms: u64) -> Vec<UnitId> {
        let state = self.state.read().await;
        let tracker = self.tracker.lock().await;
        tracker.lost_units(now_ms, self.config.lost_unit_timeout_ms, |id| state.contains(id))
    }

    /// Drop unhandled units past their TTL. `None` if the engine is busy.
    pub async fn purge_stale_unhandled(
        &self,
        now_ms: u64,
    ) -> Result<Option<Vec<UnitId>>, EngineError> {
        let Some(_write) = self.locks.try_lock(LockKey::Write) else {
            return Ok(None);
        };
        let removed = self
            .tracker
            .lock()
            .await
            .purge_older_than(now_ms, self.config.unhandled_ttl_ms);
        for id in &removed {
            self.storage.remove_unhandled(id)?;
        }
        let pruned = self.locks.prune_idle();
        if !removed.is_empty() {
            tracing::info!(purged = removed.len(), pruned_locks = pruned, "Purged stale unhandled units");
        }
        Ok(Some(removed))
    }

    /// Archive deep stable final-bad units no good unit builds on. `None` if
    /// the engine is busy.
    pub async fn archive_uncovered_final_bad(&self) -> Result<Option<Vec<UnitId>>, EngineError> {
        let Some(_write) = self.locks.try_lock(LockKey::Write) else {
            return Ok(None);
        };
        let mut state = self.state.write().await;
        let last_stable = state.last_stable_mci();
        let depth = self.config.archive_depth;
        let candidates: Vec<UnitIdx> = state
            .iter()
            .filter(|(_, r)| {
                let p = &r.props;
                p.is_stable
                    && !p.archived
                    && p.sequence == Sequence::FinalBad
                    && p.main_chain_index
                        .is_some_and(|mci| mci.saturating_add(depth) <= last_stable)
                    && r.children()
                        .iter()
                        .all(|&c| state.props(c).sequence == Sequence::FinalBad)
            })
            .map(|(idx, _)| idx)
            .collect();
        for &idx in &candidates {
            state.archive(idx);
        }
        let archived: Vec<UnitId> = candidates.iter().map(|&idx| state.get(idx).id()).collect();
        self.commit(&mut state)?;
        if !archived.is_empty() {
            tracing::info!(archived = archived.len(), "Archived final-bad units");
        }
        Ok(Some(archived))
    }
}

/// Insert a validated unit and run the consensus update it triggers.
///
/// Level, best parent and witnessed level are recomputed; disagreement with
/// what validation saw means the state changed underneath and is fatal.
fn apply_accepted_unit(
    state: &mut ConsensusState,
    unit: Unit,
    vs: &ValidationState,
    overrides: &RetreatOverrides,
) -> Result<Vec<StabilizedMci>, ConsensusError> {
    let id = unit.id;
    let parents = unit
        .parent_units
        .iter()
        .map(|p| state.idx(p).ok_or(ConsensusError::UnknownUnit(*p)))
        .collect::<Result<Vec<_>, _>>()?;
    let best_parent =
        main_chain::determine_best_parent(state, &parents).ok_or(ConsensusError::NoBestParent(id))?;
    let recomputed = state.get(best_parent).id();
    if recomputed != vs.best_parent_unit {
        return Err(ConsensusError::BestParentMismatch {
            unit: id,
            expected: vs.best_parent_unit,
            recomputed,
        });
    }
    let witnesses = state
        .resolve_witnesses(&unit)
        .map_err(ConsensusError::Invariant)?;
    let witnessed_level = witness::witnessed_level_from(state, best_parent, &witnesses)?;
    if witnessed_level != vs.witnessed_level {
        return Err(ConsensusError::WitnessedLevelMismatch {
            unit: id,
            expected: vs.witnessed_level,
            recomputed: witnessed_level,
        });
    }

    let props = UnitProps {
        level: vs.level,
        witnessed_level,
        best_parent: Some(recomputed),
        is_free: true,
        sequence: vs.sequence,
        ..UnitProps::default()
    };
    state.insert(unit, props, witnesses)?;

    for conflicting in &vs.conflicting_units {
        let Some(idx) = state.idx(conflicting) else {
            continue;
        };
        let props = state.props(idx);
        // stabilization settles it if it went stable after validation
        if !props.is_stable && props.sequence == Sequence::Good {
            state.record_mut(idx).props.sequence = Sequence::TempBad;
        }
    }

    let update = main_chain::update_main_chain(state, overrides)?;
    limci::update_latest_included_mc_index(state, update.last_mci)?;
    stability::advance_stability(state)
}
