//! The `(priority desc, sequence asc, task)` priority queue entry (§3).

use std::cmp::Ordering;

use crate::task::Task;

pub(super) struct QueueEntry(pub(super) Task);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// `BinaryHeap` is a max-heap, so "greater" must mean "should run
    /// first": higher priority wins; among equal priorities, the task
    /// submitted earlier (smaller sequence) wins, preserving FIFO (P2).
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::Reaction;
    use std::collections::BinaryHeap;

    fn task(priority: i32, sequence: u64) -> Task {
        let reaction = Reaction::new(vec![], priority, None, None, None, None, Box::new(|| None));
        Task::new(reaction, sequence, Box::new(|| {}))
    }

    #[test]
    fn higher_priority_runs_first() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry(task(crate::task::Priority::LOW, 0)));
        heap.push(QueueEntry(task(crate::task::Priority::HIGH, 1)));
        let first = heap.pop().unwrap();
        assert_eq!(first.0.priority, crate::task::Priority::HIGH);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry(task(100, 0)));
        heap.push(QueueEntry(task(100, 1)));
        heap.push(QueueEntry(task(100, 2)));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.0.sequence)).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
