//! Units waiting on dependencies that are not known locally yet.
//!
//! A unit that references unknown parents (or an unknown last-ball or
//! witness-list unit) is parked here together with the ids it is missing.
//! When a missing unit is accepted, everything waiting only on known units
//! is released for processing. When a unit turns out to be invalid, every
//! unit waiting on it is purged with it.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::consensus::{Unit, UnitId};

/// A parked unit and what it is waiting for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnhandledUnit {
    pub unit: Unit,
    pub missing: Vec<UnitId>,
    /// Peer the unit came from, if any
    pub peer: Option<String>,
    pub received_at_ms: u64,
}

/// Why a unit was rejected, kept so re-submissions are refused immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownBadUnit {
    pub reason: String,
    pub recorded_at_ms: u64,
}

/// In-memory dependency graph of unhandled units.
///
/// Persistence is the caller's job; the tracker can be rebuilt from the
/// stored records with [`DependencyTracker::restore`].
#[derive(Debug, Default)]
pub struct DependencyTracker {
    unhandled: HashMap<UnitId, UnhandledUnit>,
    /// missing unit -> units waiting on it
    dependents: HashMap<UnitId, BTreeSet<UnitId>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(units: impl IntoIterator<Item = UnhandledUnit>) -> Self {
        let mut tracker = Self::new();
        for unit in units {
            tracker.record(unit);
        }
        tracker
    }

    /// Park a unit until all of `missing` is known. Re-recording a unit
    /// replaces its previous entry.
    pub fn record(&mut self, unhandled: UnhandledUnit) {
        let id = unhandled.unit.id;
        self.remove_entry(&id);
        for dep in &unhandled.missing {
            self.dependents.entry(*dep).or_default().insert(id);
        }
        self.unhandled.insert(id, unhandled);
    }

    /// Remove a single unit, leaving whatever waits on it parked.
    pub fn take(&mut self, id: &UnitId) -> Option<UnhandledUnit> {
        self.remove_entry(id)
    }

    pub fn is_unhandled(&self, id: &UnitId) -> bool {
        self.unhandled.contains_key(id)
    }

    pub fn get(&self, id: &UnitId) -> Option<&UnhandledUnit> {
        self.unhandled.get(id)
    }

    pub fn len(&self) -> usize {
        self.unhandled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unhandled.is_empty()
    }

    /// Release units that were waiting on `trigger` and now have every
    /// dependency satisfied according to `is_known`.
    ///
    /// Released units are removed from the tracker and returned oldest first.
    pub fn ready_units(
        &mut self,
        trigger: &UnitId,
        is_known: impl Fn(&UnitId) -> bool,
    ) -> Vec<UnhandledUnit> {
        let Some(waiting) = self.dependents.remove(trigger) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for id in waiting {
            let satisfied = self
                .unhandled
                .get(&id)
                .is_some_and(|u| u.missing.iter().all(&is_known));
            if satisfied {
                if let Some(unit) = self.remove_entry(&id) {
                    ready.push(unit);
                }
            }
        }
        ready.sort_by(|a, b| {
            a.received_at_ms
                .cmp(&b.received_at_ms)
                .then_with(|| a.unit.id.cmp(&b.unit.id))
        });
        if !ready.is_empty() {
            tracing::debug!(
                trigger = %trigger,
                released = ready.len(),
                "Released units waiting on dependency"
            );
        }
        ready
    }

    /// Remove `id` and, transitively, every unit waiting on it.
    ///
    /// Returns the ids of the removed unhandled units; `id` itself is
    /// included only if it was unhandled.
    pub fn purge(&mut self, id: &UnitId) -> Vec<UnitId> {
        let mut removed = Vec::new();
        if self.remove_entry(id).is_some() {
            removed.push(*id);
        }
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            let Some(waiting) = self.dependents.remove(&current) else {
                continue;
            };
            for dependent in waiting {
                if self.remove_entry(&dependent).is_some() {
                    removed.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        removed
    }

    /// Missing dependencies that nobody has delivered for longer than
    /// `timeout_ms`. These should be requested again from peers.
    pub fn lost_units(
        &self,
        now_ms: u64,
        timeout_ms: u64,
        is_known: impl Fn(&UnitId) -> bool,
    ) -> Vec<UnitId> {
        let mut lost: Vec<UnitId> = self
            .dependents
            .iter()
            .filter(|(missing, _)| !is_known(*missing) && !self.unhandled.contains_key(*missing))
            .filter(|(_, waiting)| {
                waiting
                    .iter()
                    .filter_map(|w| self.unhandled.get(w))
                    .map(|u| u.received_at_ms)
                    .min()
                    .is_some_and(|since| now_ms.saturating_sub(since) > timeout_ms)
            })
            .map(|(missing, _)| *missing)
            .collect();
        lost.sort();
        lost
    }

    /// Drop unhandled units received more than `ttl_ms` ago, together with
    /// everything waiting on them.
    pub fn purge_older_than(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<UnitId> {
        let mut stale: Vec<UnitId> = self
            .unhandled
            .values()
            .filter(|u| now_ms.saturating_sub(u.received_at_ms) > ttl_ms)
            .map(|u| u.unit.id)
            .collect();
        stale.sort();
        let mut removed = Vec::new();
        for id in stale {
            removed.extend(self.purge(&id));
        }
        removed
    }

    fn remove_entry(&mut self, id: &UnitId) -> Option<UnhandledUnit> {
        let entry = self.unhandled.remove(id)?;
        for dep in &entry.missing {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(id);
                if set.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::UnitBuilder;

    fn unit(nonce: u64, parents: &[UnitId]) -> Unit {
        UnitBuilder::new()
            .parents(parents.iter().copied())
            .witness_list_unit(UnitId([0; 32]))
            .timestamp(nonce)
            .build()
    }

    fn waiting(unit: Unit, missing: &[UnitId], at: u64) -> UnhandledUnit {
        UnhandledUnit {
            unit,
            missing: missing.to_vec(),
            peer: None,
            received_at_ms: at,
        }
    }

    #[test]
    fn unit_released_when_missing_parent_arrives() {
        let mut tracker = DependencyTracker::new();
        let parent = UnitId([1; 32]);
        let d = unit(1, &[parent]);
        let d_id = d.id;
        tracker.record(waiting(d, &[parent], 100));
        assert!(tracker.is_unhandled(&d_id));

        let ready = tracker.ready_units(&parent, |id| *id == parent);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].unit.id, d_id);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unit_waits_for_all_dependencies() {
        let mut tracker = DependencyTracker::new();
        let p1 = UnitId([1; 32]);
        let p2 = UnitId([2; 32]);
        let d = unit(1, &[p1, p2]);
        tracker.record(waiting(d, &[p1, p2], 100));

        assert!(tracker.ready_units(&p1, |id| *id == p1).is_empty());
        assert_eq!(tracker.len(), 1);
        let ready = tracker.ready_units(&p2, |id| *id == p1 || *id == p2);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn purge_cascades_to_dependents() {
        let mut tracker = DependencyTracker::new();
        let missing = UnitId([1; 32]);
        let a = unit(1, &[missing]);
        let a_id = a.id;
        let b = unit(2, &[a_id]);
        let b_id = b.id;
        let c = unit(3, &[UnitId([3; 32])]);
        tracker.record(waiting(a, &[missing], 100));
        tracker.record(waiting(b, &[a_id], 110));
        tracker.record(waiting(c, &[UnitId([3; 32])], 120));

        let removed = tracker.purge(&missing);
        assert_eq!(removed, vec![a_id, b_id]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn lost_units_only_reports_old_unknown_dependencies() {
        let mut tracker = DependencyTracker::new();
        let lost = UnitId([1; 32]);
        let fresh = UnitId([2; 32]);
        let known = UnitId([3; 32]);
        tracker.record(waiting(unit(1, &[lost]), &[lost], 1_000));
        tracker.record(waiting(unit(2, &[fresh]), &[fresh], 9_500));
        tracker.record(waiting(unit(3, &[known]), &[known], 1_000));

        let found = tracker.lost_units(10_000, 8_000, |id| *id == known);
        assert_eq!(found, vec![lost]);
    }

    #[test]
    fn purge_older_than_drops_stale_units() {
        let mut tracker = DependencyTracker::new();
        let old = unit(1, &[UnitId([1; 32])]);
        let old_id = old.id;
        tracker.record(waiting(old, &[UnitId([1; 32])], 0));
        tracker.record(waiting(unit(2, &[UnitId([2; 32])]), &[UnitId([2; 32])], 5_000));

        let removed = tracker.purge_older_than(6_000, 3_000);
        assert_eq!(removed, vec![old_id]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn restore_rebuilds_dependency_edges() {
        let parent = UnitId([7; 32]);
        let d = unit(1, &[parent]);
        let mut tracker = DependencyTracker::restore(vec![waiting(d, &[parent], 0)]);
        assert_eq!(tracker.ready_units(&parent, |_| true).len(), 1);
    }
}
