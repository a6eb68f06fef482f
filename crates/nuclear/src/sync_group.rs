//! Per-sync-group serializer (§4.3): at most one task per opaque key runs
//! at a time; the rest wait in a priority-ordered queue.
//!
//! Sync is wired entirely through the two generic reaction hooks the
//! scheduler already understands — `reschedule` (called before a task is
//! enqueued) and `postcondition` (called right after a task's payload
//! runs) — exactly as described in §4.2's "Reschedule hook" note and
//! §4.3. The scheduler itself has no built-in notion of sync groups.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::type_key::TypeKey;

struct WaiterEntry(Task);

impl PartialEq for WaiterEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}
impl Eq for WaiterEntry {}
impl PartialOrd for WaiterEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WaiterEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

#[derive(Default)]
struct GroupState {
    running: bool,
    waiters: BinaryHeap<WaiterEntry>,
}

#[derive(Default)]
pub(crate) struct SyncGroupRegistry {
    groups: DashMap<TypeKey, Mutex<GroupState>>,
}

impl SyncGroupRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(SyncGroupRegistry::default())
    }

    /// §4.3 reschedule algorithm: acquire the group if nobody is running,
    /// otherwise queue behind existing waiters (priority-ordered).
    fn try_acquire_or_queue(&self, key: TypeKey, task: Task) -> Option<Task> {
        let entry = self.groups.entry(key).or_default();
        let mut state = entry.lock().unwrap();
        if !state.running {
            state.running = true;
            Some(task)
        } else {
            state.waiters.push(WaiterEntry(task));
            None
        }
    }

    /// §4.3 postcondition algorithm: mark the group idle, then hand back
    /// the next highest-priority waiter (if any) so it can be resubmitted
    /// through the scheduler.
    ///
    /// `running` must be cleared *before* the waiter is returned: the
    /// caller resubmits it via `Scheduler::submit`, which re-runs this same
    /// group's `reschedule` hook (`try_acquire_or_queue`) before the task
    /// is actually enqueued. If `running` were still `true` at that point,
    /// the resubmitted waiter would see the group as busy and re-park
    /// itself behind nothing, forever — only the first task to ever touch
    /// the group would run.
    fn release(&self, key: TypeKey) -> Option<Task> {
        let entry = self.groups.get(&key)?;
        let mut state = entry.lock().unwrap();
        state.running = false;
        state.waiters.pop().map(|WaiterEntry(next)| next)
    }

    /// Build the `reschedule` hook a reaction bound with `sync::<G>()`
    /// should install.
    pub(crate) fn reschedule_hook(
        self: &Arc<Self>,
        key: TypeKey,
    ) -> Box<dyn Fn(Task) -> Option<Task> + Send + Sync> {
        let registry = Arc::clone(self);
        Box::new(move |task| registry.try_acquire_or_queue(key, task))
    }

    /// Build the `postcondition` hook that releases the group and
    /// resubmits the next waiter (if any) back onto the scheduler.
    pub(crate) fn postcondition_hook(
        self: &Arc<Self>,
        key: TypeKey,
        scheduler: Weak<Scheduler>,
    ) -> Box<dyn Fn(&crate::task::TaskStatistics) + Send + Sync> {
        let registry = Arc::clone(self);
        Box::new(move |_stats| {
            if let Some(next) = registry.release(key) {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.submit(next);
                }
                // If the scheduler is already gone we are mid-shutdown;
                // the waiter is simply dropped along with everything else.
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::Reaction;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn task(priority: i32, sequence: u64, reaction: Arc<Reaction>) -> Task {
        Task::new(reaction, sequence, Box::new(|| {}))
            .tap_priority(priority)
    }

    // Small test-only helper: Task's priority is normally derived from its
    // reaction, but tests want to vary it independently of constructing
    // many distinct reactions.
    trait TapPriority {
        fn tap_priority(self, priority: i32) -> Self;
    }
    impl TapPriority for Task {
        fn tap_priority(mut self, priority: i32) -> Self {
            self.priority = priority;
            self
        }
    }

    #[test]
    fn second_task_waits_until_first_releases() {
        let registry = SyncGroupRegistry::new();
        let key = TypeKey::of::<()>();
        let reaction = Reaction::new(vec![], 100, None, None, None, None, Box::new(|| None));

        let ran = Arc::new(AtomicUsize::new(0));

        let first = task(100, 0, Arc::clone(&reaction));
        let second = task(100, 1, Arc::clone(&reaction));

        assert!(registry.try_acquire_or_queue(key, first).is_some());
        assert!(registry.try_acquire_or_queue(key, second).is_none());

        let released = registry.release(key);
        assert!(released.is_some(), "releasing must hand back the waiter");
        assert!(registry.release(key).is_none(), "group is idle now");

        ran.fetch_add(1, AtomicOrdering::Relaxed);
        assert_eq!(ran.load(AtomicOrdering::Relaxed), 1);
    }
}
