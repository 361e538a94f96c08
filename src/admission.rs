//! Global admission control: a cap on running transfers plus a wait set.
//!
//! Slots are reserved here rather than derived from record statuses, so the
//! count can never exceed the cap even while status updates are in flight.
//! The lock is never held across I/O or an await.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::state::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    Held,
}

#[derive(Debug, Default)]
struct Slots {
    max_parallel: usize,
    /// Running transfers, keyed to the order they were admitted in.
    active: HashMap<PathBuf, u64>,
    /// Waiting transfers and their last attempt time.
    held: HashMap<PathBuf, DateTime<Utc>>,
    admitted: u64,
}

impl Slots {
    fn has_free_slot(&self) -> bool {
        self.active.len() < self.max_parallel
    }

    fn occupy(&mut self, id: PathBuf) {
        self.admitted += 1;
        self.active.insert(id, self.admitted);
    }

    /// Move earliest-waiting held transfers into free slots.
    fn promote(&mut self) -> Vec<PathBuf> {
        let mut promoted = Vec::new();
        while self.has_free_slot() {
            let Some(next) = self
                .held
                .iter()
                .min_by_key(|(_, last_attempt)| **last_attempt)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.held.remove(&next);
            self.occupy(next.clone());
            promoted.push(next);
        }
        promoted
    }

    /// Give up the slots above the cap, most recently admitted first.
    fn shed(&mut self) -> Vec<PathBuf> {
        let excess = self.active.len().saturating_sub(self.max_parallel);
        if excess == 0 {
            return Vec::new();
        }
        let mut newest: Vec<(PathBuf, u64)> = self
            .active
            .iter()
            .map(|(id, order)| (id.clone(), *order))
            .collect();
        newest.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        newest.truncate(excess);
        newest
            .into_iter()
            .map(|(id, _)| {
                self.active.remove(&id);
                id
            })
            .collect()
    }
}

/// Slot changes caused by a new cap.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Rebalance {
    /// Held transfers moved into free slots. Callers must start them.
    pub promoted: Vec<PathBuf>,
    /// Transfers that lost their slot. Callers must stop and hold them.
    pub demoted: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct AdmissionController {
    slots: Mutex<Slots>,
}

impl AdmissionController {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                max_parallel: max_parallel.max(1),
                ..Slots::default()
            }),
        }
    }

    /// Reserve a running slot for `id`, or park it in the held set.
    pub fn admit(&self, id: &Path, last_attempt: DateTime<Utc>) -> Admission {
        let mut slots = lock(&self.slots);
        if slots.active.contains_key(id) {
            return Admission::Started;
        }
        if slots.has_free_slot() {
            slots.held.remove(id);
            slots.occupy(id.to_path_buf());
            Admission::Started
        } else {
            slots.held.insert(id.to_path_buf(), last_attempt);
            Admission::Held
        }
    }

    /// Free the slot held by `id` and return the transfers promoted into the
    /// freed capacity. Callers must start every returned transfer.
    pub fn release(&self, id: &Path) -> Vec<PathBuf> {
        let mut slots = lock(&self.slots);
        slots.active.remove(id);
        slots.promote()
    }

    /// Drop `id` from the held set without starting it.
    pub fn withdraw(&self, id: &Path) -> bool {
        lock(&self.slots).held.remove(id).is_some()
    }

    /// Park `id` in the held set without asking for a slot.
    pub fn hold(&self, id: &Path, last_attempt: DateTime<Utc>) {
        let mut slots = lock(&self.slots);
        slots.active.remove(id);
        slots.held.insert(id.to_path_buf(), last_attempt);
    }

    /// Lowering the cap demotes the newest runs; raising it promotes held
    /// transfers.
    pub fn set_max_parallel(&self, max_parallel: usize) -> Rebalance {
        let mut slots = lock(&self.slots);
        slots.max_parallel = max_parallel.max(1);
        let demoted = slots.shed();
        Rebalance {
            promoted: slots.promote(),
            demoted,
        }
    }

    pub fn max_parallel(&self) -> usize {
        lock(&self.slots).max_parallel
    }

    pub fn is_active(&self, id: &Path) -> bool {
        lock(&self.slots).active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.slots).active.len()
    }

    pub fn is_held(&self, id: &Path) -> bool {
        lock(&self.slots).held.contains_key(id)
    }

    pub fn held_count(&self) -> usize {
        lock(&self.slots).held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(name: &str) -> PathBuf {
        PathBuf::from(format!("/downloads/{name}"))
    }

    #[test]
    fn admits_until_cap_then_holds() {
        let ctl = AdmissionController::new(2);
        let now = Utc::now();
        assert_eq!(ctl.admit(&id("a"), now), Admission::Started);
        assert_eq!(ctl.admit(&id("b"), now), Admission::Started);
        assert_eq!(ctl.admit(&id("c"), now), Admission::Held);
        assert_eq!(ctl.active_count(), 2);
        assert!(ctl.is_held(&id("c")));
    }

    #[test]
    fn release_promotes_earliest_last_attempt_not_enqueue_order() {
        let ctl = AdmissionController::new(1);
        let now = Utc::now();
        ctl.admit(&id("running"), now);

        // Enqueued first but attempted most recently.
        ctl.admit(&id("late"), now + Duration::seconds(10));
        ctl.admit(&id("early"), now - Duration::seconds(10));
        ctl.admit(&id("middle"), now);

        assert_eq!(ctl.release(&id("running")), vec![id("early")]);
        assert_eq!(ctl.release(&id("early")), vec![id("middle")]);
        assert_eq!(ctl.release(&id("middle")), vec![id("late")]);
        assert!(ctl.release(&id("late")).is_empty());
        assert_eq!(ctl.active_count(), 0);
    }

    #[test]
    fn raising_the_cap_promotes_several_at_once() {
        let ctl = AdmissionController::new(1);
        let now = Utc::now();
        ctl.admit(&id("a"), now);
        ctl.admit(&id("b"), now + Duration::seconds(1));
        ctl.admit(&id("c"), now + Duration::seconds(2));

        let rebalance = ctl.set_max_parallel(3);
        assert_eq!(rebalance.promoted, vec![id("b"), id("c")]);
        assert!(rebalance.demoted.is_empty());
        assert_eq!(ctl.active_count(), 3);
        assert_eq!(ctl.held_count(), 0);
    }

    #[test]
    fn active_count_never_exceeds_cap() {
        let ctl = AdmissionController::new(3);
        let now = Utc::now();
        for i in 0..20 {
            ctl.admit(&id(&i.to_string()), now + Duration::seconds(i));
            assert!(ctl.active_count() <= 3);
        }
        for i in 0..20 {
            ctl.release(&id(&i.to_string()));
            assert!(ctl.active_count() <= 3);
        }
        assert_eq!(ctl.held_count(), 0);
    }

    #[test]
    fn withdrawn_transfers_are_not_promoted() {
        let ctl = AdmissionController::new(1);
        let now = Utc::now();
        ctl.admit(&id("a"), now);
        ctl.admit(&id("b"), now);
        assert!(ctl.withdraw(&id("b")));
        assert!(!ctl.withdraw(&id("b")));
        assert!(ctl.release(&id("a")).is_empty());
    }

    #[test]
    fn lowering_the_cap_demotes_the_newest_runs() {
        let ctl = AdmissionController::new(4);
        let now = Utc::now();
        for name in ["a", "b", "c", "d"] {
            assert_eq!(ctl.admit(&id(name), now), Admission::Started);
        }

        let rebalance = ctl.set_max_parallel(2);
        assert_eq!(rebalance.demoted, vec![id("d"), id("c")]);
        assert!(rebalance.promoted.is_empty());
        assert_eq!(ctl.active_count(), 2);
        assert!(ctl.is_active(&id("a")) && ctl.is_active(&id("b")));

        ctl.hold(&id("d"), now + Duration::seconds(2));
        ctl.hold(&id("c"), now + Duration::seconds(1));
        assert_eq!(ctl.held_count(), 2);

        assert_eq!(ctl.release(&id("a")), vec![id("c")]);
        let rebalance = ctl.set_max_parallel(4);
        assert_eq!(rebalance.promoted, vec![id("d")]);
        assert_eq!(ctl.active_count(), 3);
    }
}
