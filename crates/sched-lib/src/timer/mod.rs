//! Deadline-ordered timer queue
//!
//! A binary min-heap keyed by `(deadline_ns, seq)`, where `seq` is the
//! insertion sequence. Entries with equal deadlines therefore pop in
//! insertion order. A position index allows removing any pending entry in
//! O(log n), which is how parked tasks cancel their timeout on unpark.

use std::collections::HashMap;
use std::fmt;

/// Handle to a pending timer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// What to do with the task when its deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// A sleep or quota delay has ended
    Wake,
    /// A park with a deadline has expired without an unpark
    ParkTimeout,
}

/// A pending wake-up owned by the queue
#[derive(Debug, Clone)]
pub struct TimerEntry<T> {
    id: TimerId,
    pub task: T,
    pub deadline_ns: i64,
    pub action: TimerAction,
}

impl<T> TimerEntry<T> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    fn key(&self) -> (i64, u64) {
        (self.deadline_ns, self.id.0)
    }
}

/// Min-heap of timer entries with arbitrary removal
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: Vec<TimerEntry<T>>,
    positions: HashMap<TimerId, usize>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Add an entry and return its handle
    pub fn insert(&mut self, task: T, deadline_ns: i64, action: TimerAction) -> TimerId {
        let id = TimerId(self.next_seq);
        self.next_seq += 1;

        let index = self.heap.len();
        self.heap.push(TimerEntry {
            id,
            task,
            deadline_ns,
            action,
        });
        self.positions.insert(id, index);
        self.sift_up(index);
        id
    }

    /// Entry with the earliest deadline
    pub fn peek(&self) -> Option<&TimerEntry<T>> {
        self.heap.first()
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.peek().map(|entry| entry.deadline_ns)
    }

    /// Remove and return the entry with the earliest deadline
    pub fn pop(&mut self) -> Option<TimerEntry<T>> {
        self.remove_at(0)
    }

    /// Remove a pending entry by handle
    ///
    /// Returns `None` if the entry already fired or was removed.
    pub fn remove(&mut self, id: TimerId) -> Option<TimerEntry<T>> {
        let index = *self.positions.get(&id)?;
        self.remove_at(index)
    }

    /// Pop every entry whose deadline is `<= now`, in deadline order
    pub fn pop_expired(&mut self, now: i64) -> Vec<TimerEntry<T>> {
        let mut expired = Vec::new();
        while self.next_deadline().is_some_and(|deadline| deadline <= now) {
            if let Some(entry) = self.pop() {
                expired.push(entry);
            }
        }
        expired
    }

    /// Drop every pending entry, returning them in heap order
    pub fn drain(&mut self) -> Vec<TimerEntry<T>> {
        self.positions.clear();
        std::mem::take(&mut self.heap)
    }

    fn remove_at(&mut self, index: usize) -> Option<TimerEntry<T>> {
        if index >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(index, last);
        let entry = self.heap.pop()?;
        self.positions.remove(&entry.id);

        if index < self.heap.len() {
            // The moved element may need to go either way
            if index > 0 && self.less(index, (index - 1) / 2) {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        Some(entry)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.heap[a].key() < self.heap[b].key()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].id, a);
        self.positions.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_deadlines<T>(queue: &mut TimerQueue<T>) -> Vec<i64> {
        std::iter::from_fn(|| queue.pop().map(|e| e.deadline_ns)).collect()
    }

    /// Small deterministic generator so the tests need no rand dependency
    fn pseudo_random(seed: u64, count: usize) -> Vec<i64> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) % 1000) as i64
            })
            .collect()
    }

    #[test]
    fn test_pop_returns_sorted_deadlines() {
        let deadlines = pseudo_random(7, 200);
        let mut queue = TimerQueue::new();
        for (i, d) in deadlines.iter().enumerate() {
            queue.insert(i, *d, TimerAction::Wake);
        }

        let mut expected = deadlines.clone();
        expected.sort();
        assert_eq!(drain_deadlines(&mut queue), expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_pop_in_insertion_order() {
        let mut queue = TimerQueue::new();
        for task in ["a", "b", "c", "d"] {
            queue.insert(task, 50, TimerAction::Wake);
        }
        queue.insert("early", 10, TimerAction::ParkTimeout);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|e| e.task)).collect();
        assert_eq!(order, vec!["early", "a", "b", "c", "d"]);
    }

    #[test]
    fn test_remove_arbitrary_preserves_order() {
        let deadlines = pseudo_random(42, 64);
        let mut queue = TimerQueue::new();
        let ids: Vec<_> = deadlines
            .iter()
            .map(|d| queue.insert(*d, *d, TimerAction::Wake))
            .collect();

        // Remove every third entry, none of them necessarily the minimum
        let mut expected = Vec::new();
        for (i, (id, d)) in ids.iter().zip(&deadlines).enumerate() {
            if i % 3 == 1 {
                let removed = queue.remove(*id).unwrap();
                assert_eq!(removed.deadline_ns, *d);
                assert!(!queue.contains(*id));
            } else {
                expected.push(*d);
            }
        }
        expected.sort();
        assert_eq!(drain_deadlines(&mut queue), expected);
    }

    #[test]
    fn test_remove_non_minimum() {
        let mut queue = TimerQueue::new();
        queue.insert("a", 10, TimerAction::Wake);
        let b = queue.insert("b", 30, TimerAction::Wake);
        queue.insert("c", 20, TimerAction::Wake);
        queue.insert("d", 40, TimerAction::Wake);

        assert_eq!(queue.remove(b).map(|e| e.task), Some("b"));
        assert_eq!(queue.remove(b).map(|e| e.task), None);
        assert_eq!(drain_deadlines(&mut queue), vec![10, 20, 40]);
    }

    #[test]
    fn test_remove_last_and_only() {
        let mut queue = TimerQueue::new();
        let only = queue.insert((), 5, TimerAction::Wake);
        assert!(queue.remove(only).is_some());
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_pop_expired() {
        let mut queue = TimerQueue::new();
        for d in [30, 10, 20, 40] {
            queue.insert(d, d, TimerAction::Wake);
        }

        let fired: Vec<_> = queue.pop_expired(25).into_iter().map(|e| e.task).collect();
        assert_eq!(fired, vec![10, 20]);
        assert_eq!(queue.next_deadline(), Some(30));
        assert!(queue.pop_expired(0).is_empty());
    }

    #[test]
    fn test_popped_entry_cannot_be_removed() {
        let mut queue = TimerQueue::new();
        let id = queue.insert(1, 1, TimerAction::ParkTimeout);
        let entry = queue.pop().unwrap();
        assert_eq!(entry.id(), id);
        assert_eq!(entry.action, TimerAction::ParkTimeout);
        assert!(queue.remove(id).is_none());
    }
}
