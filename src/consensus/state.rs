//! In-memory consensus state.
//!
//! `ConsensusState` owns an arena of unit records addressed by a dense
//! `UnitIdx`, plus a hash -> index lookup and the secondary indices the
//! algorithms need (children, free units, units per MCI, units per author,
//! spenders per source unit). Records touched since the last
//! `take_changes()` are tracked so the engine can persist exactly those.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::ball::BallId;
use super::unit::{Address, Sequence, Unit, UnitId, UnitProps};
use super::ConsensusError;
use crate::node::storage::{Storage, StorageError};

/// Dense arena index of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitIdx(u32);

impl UnitIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Index of the record appended after `len` existing ones.
    fn for_len(len: usize) -> Result<Self, ConsensusError> {
        u32::try_from(len)
            .map(UnitIdx)
            .map_err(|_| ConsensusError::Invariant(format!("unit index {len} does not fit in u32")))
    }
}

/// A unit together with everything the engine knows about it.
#[derive(Clone, Debug)]
pub struct UnitRecord {
    pub unit: Unit,
    pub props: UnitProps,
    /// Resolved witness list (inline or via `witness_list_unit`)
    pub witnesses: Vec<Address>,
    pub(crate) parents: Vec<UnitIdx>,
    pub(crate) children: Vec<UnitIdx>,
    pub(crate) best_parent: Option<UnitIdx>,
}

impl UnitRecord {
    pub fn id(&self) -> UnitId {
        self.unit.id
    }

    pub fn parents(&self) -> &[UnitIdx] {
        &self.parents
    }

    pub fn children(&self) -> &[UnitIdx] {
        &self.children
    }

    pub fn best_parent(&self) -> Option<UnitIdx> {
        self.best_parent
    }

    /// Number of this unit's authors that appear in `witnesses`.
    pub fn witness_author_count(&self, witnesses: &[Address]) -> usize {
        self.unit
            .authors
            .iter()
            .filter(|a| witnesses.contains(a))
            .count()
    }
}

/// Records changed since the last `take_changes()`.
#[derive(Debug, Default)]
pub struct StateChanges {
    pub new_units: Vec<UnitIdx>,
    pub touched: Vec<UnitIdx>,
    pub new_balls: Vec<(BallId, UnitId)>,
    pub last_stable_mci: Option<u64>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.new_units.is_empty()
            && self.touched.is_empty()
            && self.new_balls.is_empty()
            && self.last_stable_mci.is_none()
    }
}

/// The consensus engine's view of the DAG.
#[derive(Clone, Debug)]
pub struct ConsensusState {
    records: Vec<UnitRecord>,
    by_id: HashMap<UnitId, UnitIdx>,
    by_ball: HashMap<BallId, UnitIdx>,
    free: BTreeSet<UnitIdx>,
    unstable: BTreeSet<UnitIdx>,
    by_mci: BTreeMap<u64, BTreeSet<UnitIdx>>,
    by_author: HashMap<Address, Vec<UnitIdx>>,
    spenders: HashMap<UnitId, Vec<UnitIdx>>,
    last_stable_mci: u64,
    new_units: Vec<UnitIdx>,
    touched: BTreeSet<UnitIdx>,
    new_balls: Vec<(BallId, UnitId)>,
    stable_point_moved: bool,
}

impl ConsensusState {
    /// Start a fresh DAG from its genesis unit.
    ///
    /// Genesis is level 0, MCI 0, on the main chain and stable from the start.
    pub fn new(genesis: Unit) -> Result<Self, ConsensusError> {
        if !genesis.is_genesis() {
            return Err(ConsensusError::Invariant(format!(
                "genesis {} has parents",
                genesis.id
            )));
        }
        let witnesses = genesis
            .witnesses
            .clone()
            .ok_or_else(|| ConsensusError::Invariant("genesis without inline witnesses".into()))?;
        let ball = super::ball::ball_hash(&genesis.id, &[], &[], false);
        let props = UnitProps {
            level: 0,
            witnessed_level: 0,
            best_parent: None,
            main_chain_index: Some(0),
            latest_included_mc_index: None,
            is_on_main_chain: true,
            is_free: true,
            is_stable: true,
            sequence: Sequence::Good,
            ball: Some(ball),
            skiplist: vec![],
            content_hash: None,
            archived: false,
        };
        let mut state = Self::empty();
        let idx = state.push_record(genesis, props, witnesses)?;
        state.new_units.push(idx);
        state.new_balls.push((ball, state.records[idx.index()].id()));
        state.stable_point_moved = true;
        Ok(state)
    }

    fn empty() -> Self {
        ConsensusState {
            records: Vec::new(),
            by_id: HashMap::new(),
            by_ball: HashMap::new(),
            free: BTreeSet::new(),
            unstable: BTreeSet::new(),
            by_mci: BTreeMap::new(),
            by_author: HashMap::new(),
            spenders: HashMap::new(),
            last_stable_mci: 0,
            new_units: Vec::new(),
            touched: BTreeSet::new(),
            new_balls: Vec::new(),
            stable_point_moved: false,
        }
    }

    /// Rebuild the state from persisted units and props.
    ///
    /// Records are inserted in level order so every parent precedes its children.
    pub fn from_records(
        mut records: Vec<(Unit, UnitProps)>,
        last_stable_mci: u64,
    ) -> Result<Self, ConsensusError> {
        records.sort_by(|a, b| a.1.level.cmp(&b.1.level).then_with(|| a.0.id.cmp(&b.0.id)));
        let mut state = Self::empty();
        for (unit, props) in records {
            state.push_record(unit, props, Vec::new())?;
        }
        if state.records.is_empty() {
            return Err(ConsensusError::Invariant("no genesis unit in storage".into()));
        }
        // witness-list units are not necessarily lower in level
        for i in 0..state.records.len() {
            let witnesses = state
                .resolve_witnesses(&state.records[i].unit)
                .map_err(ConsensusError::Invariant)?;
            state.records[i].witnesses = witnesses;
        }
        state.last_stable_mci = last_stable_mci;
        Ok(state)
    }

    /// Load the persisted DAG from storage.
    pub fn load<S: Storage + ?Sized>(storage: &S) -> Result<Self, StorageError> {
        let records = storage.load_records()?;
        let last_stable_mci = storage.last_stable_mci()?.unwrap_or(0);
        Self::from_records(records, last_stable_mci)
            .map_err(|e| StorageError::Corrupted(e.to_string()))
    }

    fn push_record(
        &mut self,
        unit: Unit,
        props: UnitProps,
        witnesses: Vec<Address>,
    ) -> Result<UnitIdx, ConsensusError> {
        if self.by_id.contains_key(&unit.id) {
            return Err(ConsensusError::Invariant(format!("duplicate unit {}", unit.id)));
        }
        let idx = UnitIdx::for_len(self.records.len())?;
        let mut parents = Vec::with_capacity(unit.parent_units.len());
        for parent_id in &unit.parent_units {
            let parent = *self
                .by_id
                .get(parent_id)
                .ok_or(ConsensusError::UnknownUnit(*parent_id))?;
            parents.push(parent);
        }
        let best_parent = match props.best_parent {
            Some(bp) => Some(*self.by_id.get(&bp).ok_or(ConsensusError::UnknownUnit(bp))?),
            None => None,
        };
        for &parent in &parents {
            self.records[parent.index()].children.push(idx);
        }
        if props.is_free {
            self.free.insert(idx);
        }
        if !props.is_stable {
            self.unstable.insert(idx);
        }
        if let Some(mci) = props.main_chain_index {
            self.by_mci.entry(mci).or_default().insert(idx);
        }
        if let Some(ball) = props.ball {
            self.by_ball.insert(ball, idx);
        }
        for author in &unit.authors {
            self.by_author.entry(*author).or_default().push(idx);
        }
        for input in &unit.inputs {
            self.spenders.entry(input.unit).or_default().push(idx);
        }
        self.by_id.insert(unit.id, idx);
        self.records.push(UnitRecord {
            unit,
            props,
            witnesses,
            parents,
            children: Vec::new(),
            best_parent,
        });
        Ok(idx)
    }

    /// Append a newly accepted unit. Its parents stop being free.
    pub(crate) fn insert(
        &mut self,
        unit: Unit,
        props: UnitProps,
        witnesses: Vec<Address>,
    ) -> Result<UnitIdx, ConsensusError> {
        let idx = self.push_record(unit, props, witnesses)?;
        let parents = self.records[idx.index()].parents.clone();
        for parent in parents {
            if self.records[parent.index()].props.is_free {
                self.record_mut(parent).props.is_free = false;
                self.free.remove(&parent);
            }
        }
        self.new_units.push(idx);
        Ok(idx)
    }

    /// Resolve a unit's witness list: inline, or the inline list of its
    /// witness-list unit.
    pub fn resolve_witnesses(&self, unit: &Unit) -> Result<Vec<Address>, String> {
        match (&unit.witnesses, &unit.witness_list_unit) {
            (Some(list), None) => Ok(list.clone()),
            (None, Some(wlu)) => {
                let idx = self
                    .idx(wlu)
                    .ok_or_else(|| format!("witness list unit {} not known", wlu))?;
                self.records[idx.index()]
                    .unit
                    .witnesses
                    .clone()
                    .ok_or_else(|| format!("witness list unit {} has no inline witnesses", wlu))
            }
            (Some(_), Some(_)) => Err("both inline witnesses and witness list unit".into()),
            (None, None) => Err("no witnesses".into()),
        }
    }

    pub fn idx(&self, id: &UnitId) -> Option<UnitIdx> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, idx: UnitIdx) -> &UnitRecord {
        &self.records[idx.index()]
    }

    pub fn get_by_id(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.idx(id).map(|idx| self.get(idx))
    }

    pub fn props(&self, idx: UnitIdx) -> &UnitProps {
        &self.records[idx.index()].props
    }

    /// Mutable access; the record is scheduled for persistence.
    pub(crate) fn record_mut(&mut self, idx: UnitIdx) -> &mut UnitRecord {
        self.touched.insert(idx);
        &mut self.records[idx.index()]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn genesis(&self) -> UnitIdx {
        UnitIdx(0)
    }

    pub fn is_genesis(&self, idx: UnitIdx) -> bool {
        idx == self.genesis()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitIdx, &UnitRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (UnitIdx(i as u32), r))
    }

    pub fn free_units(&self) -> impl Iterator<Item = UnitIdx> + '_ {
        self.free.iter().copied()
    }

    /// Units not yet stable, in arena order.
    pub fn unstable_units(&self) -> impl Iterator<Item = UnitIdx> + '_ {
        self.unstable.iter().copied()
    }

    pub(crate) fn set_stable(&mut self, idx: UnitIdx) {
        if self.unstable.remove(&idx) {
            self.record_mut(idx).props.is_stable = true;
        }
    }

    pub fn units_at_mci(&self, mci: u64) -> Vec<UnitIdx> {
        self.by_mci
            .get(&mci)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Units whose MCI is strictly greater than `mci`.
    pub fn units_above_mci(&self, mci: u64) -> Vec<UnitIdx> {
        self.by_mci
            .range(mci + 1..)
            .flat_map(|(_, set)| set.iter().copied())
            .collect()
    }

    /// The main-chain unit at `mci`, if exactly one is known.
    pub fn mc_unit_at(&self, mci: u64) -> Option<UnitIdx> {
        let mut on_mc = self
            .by_mci
            .get(&mci)?
            .iter()
            .copied()
            .filter(|&i| self.records[i.index()].props.is_on_main_chain);
        let first = on_mc.next()?;
        match on_mc.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    pub fn max_mci(&self) -> Option<u64> {
        self.by_mci.keys().next_back().copied()
    }

    pub(crate) fn set_main_chain_index(&mut self, idx: UnitIdx, mci: Option<u64>) {
        let old = self.records[idx.index()].props.main_chain_index;
        if old == mci {
            return;
        }
        if let Some(old) = old {
            if let Some(set) = self.by_mci.get_mut(&old) {
                set.remove(&idx);
                if set.is_empty() {
                    self.by_mci.remove(&old);
                }
            }
        }
        if let Some(new) = mci {
            self.by_mci.entry(new).or_default().insert(idx);
        }
        self.record_mut(idx).props.main_chain_index = mci;
    }

    pub(crate) fn set_ball(&mut self, idx: UnitIdx, ball: BallId) {
        let id = self.records[idx.index()].id();
        self.record_mut(idx).props.ball = Some(ball);
        self.by_ball.insert(ball, idx);
        self.new_balls.push((ball, id));
    }

    /// Mark a unit archived and drop the outputs it spent.
    pub(crate) fn archive(&mut self, idx: UnitIdx) {
        let inputs = std::mem::take(&mut self.records[idx.index()].unit.inputs);
        for input in &inputs {
            if let Some(spenders) = self.spenders.get_mut(&input.unit) {
                spenders.retain(|&s| s != idx);
                if spenders.is_empty() {
                    self.spenders.remove(&input.unit);
                }
            }
        }
        self.record_mut(idx).props.archived = true;
    }

    pub fn unit_by_ball(&self, ball: &BallId) -> Option<UnitIdx> {
        self.by_ball.get(ball).copied()
    }

    pub fn units_by_author(&self, address: &Address) -> &[UnitIdx] {
        self.by_author
            .get(address)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Units spending any output of `unit`.
    pub fn spenders_of(&self, unit: &UnitId) -> &[UnitIdx] {
        self.spenders
            .get(unit)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn last_stable_mci(&self) -> u64 {
        self.last_stable_mci
    }

    pub(crate) fn set_last_stable_mci(&mut self, mci: u64) {
        self.last_stable_mci = mci;
        self.stable_point_moved = true;
    }

    /// Drain the change log accumulated since the last call.
    pub fn take_changes(&mut self) -> StateChanges {
        let new_units = std::mem::take(&mut self.new_units);
        let touched = std::mem::take(&mut self.touched)
            .into_iter()
            .filter(|idx| !new_units.contains(idx))
            .collect();
        let last_stable_mci = if std::mem::take(&mut self.stable_point_moved) {
            Some(self.last_stable_mci)
        } else {
            None
        };
        StateChanges {
            new_units,
            touched,
            new_balls: std::mem::take(&mut self.new_balls),
            last_stable_mci,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for building DAGs directly against the state, bypassing validation.

    use super::*;
    use crate::consensus::unit::UnitBuilder;
    use crate::consensus::{limci, main_chain, stability, witness, RetreatOverrides};

    pub fn witness_addr(i: usize) -> Address {
        let mut a = [0u8; 32];
        a[0] = 0xee;
        a[1] = i as u8;
        Address(a)
    }

    pub fn witness_list() -> Vec<Address> {
        (0..crate::constants::COUNT_WITNESSES)
            .map(witness_addr)
            .collect()
    }

    pub fn user_addr(n: u8) -> Address {
        Address([n; 32])
    }

    pub fn genesis_state() -> ConsensusState {
        let genesis = UnitBuilder::new()
            .witnesses(witness_list())
            .authors_all(witness_list())
            .build();
        ConsensusState::new(genesis).unwrap()
    }

    /// Add a unit directly and run the full consensus update.
    pub fn add(
        state: &mut ConsensusState,
        parents: &[UnitIdx],
        author: Address,
        nonce: u64,
    ) -> UnitIdx {
        add_with(state, parents, author, nonce, Sequence::Good, vec![])
    }

    pub fn add_with(
        state: &mut ConsensusState,
        parents: &[UnitIdx],
        author: Address,
        nonce: u64,
        sequence: Sequence,
        inputs: Vec<crate::consensus::unit::OutputRef>,
    ) -> UnitIdx {
        let idx = insert_unit(state, parents, author, nonce, sequence, inputs);
        let update = main_chain::update_main_chain(state, &RetreatOverrides::default()).unwrap();
        limci::update_latest_included_mc_index(state, update.last_mci).unwrap();
        stability::advance_stability(state).unwrap();
        idx
    }

    /// Append a unit with level, witnessed level and best parent filled in,
    /// without touching the main chain.
    pub fn insert_unit(
        state: &mut ConsensusState,
        parents: &[UnitIdx],
        author: Address,
        nonce: u64,
        sequence: Sequence,
        inputs: Vec<crate::consensus::unit::OutputRef>,
    ) -> UnitIdx {
        let genesis_id = state.get(state.genesis()).id();
        let mut builder = UnitBuilder::new()
            .parents(parents.iter().map(|&p| state.get(p).id()))
            .witness_list_unit(genesis_id)
            .author(author)
            .timestamp(nonce);
        for input in inputs {
            builder = builder.spend(input);
        }
        let unit = builder.build();
        let witnesses = state.resolve_witnesses(&unit).unwrap();
        let parent_idxs: Vec<UnitIdx> = unit
            .parent_units
            .iter()
            .map(|p| state.idx(p).unwrap())
            .collect();
        let best_parent = main_chain::determine_best_parent(state, &parent_idxs).unwrap();
        let witnessed_level =
            witness::witnessed_level_from(state, best_parent, &witnesses).unwrap();
        let level = parent_idxs
            .iter()
            .map(|&p| state.props(p).level)
            .max()
            .unwrap()
            + 1;
        let props = UnitProps {
            level,
            witnessed_level,
            best_parent: Some(state.get(best_parent).id()),
            is_free: true,
            sequence,
            ..UnitProps::default()
        };
        state.insert(unit, props, witnesses).unwrap()
    }

    /// Extend a single-parent chain of witness-authored units.
    pub fn witness_chain(
        state: &mut ConsensusState,
        from: UnitIdx,
        len: usize,
        first_witness: usize,
    ) -> Vec<UnitIdx> {
        let mut out = Vec::with_capacity(len);
        let mut tip = from;
        for i in 0..len {
            let w = witness_addr((first_witness + i) % crate::constants::COUNT_WITNESSES);
            tip = add(state, &[tip], w, (first_witness + i) as u64 + 10_000);
            out.push(tip);
        }
        out
    }
}
