//! Deterministic event queue. Events fire in time order; events scheduled
//! for the same instant fire in the order they were scheduled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use wimax_core::SimTime;

struct Scheduled<E> {
    at: SimTime,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    // BinaryHeap is a max-heap, so the earliest event must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct EventQueue<E> {
    heap: BinaryHeap<Scheduled<E>>,
    next_seq: u64,
    now: SimTime,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            now: SimTime::ZERO,
        }
    }

    /// Time of the event popped last.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedules `event` at `at`. Times in the past are clamped to now.
    pub fn schedule(&mut self, at: SimTime, event: E) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            at: at.max(self.now),
            seq,
            event,
        });
    }

    pub fn schedule_in(&mut self, delay: Duration, event: E) {
        self.schedule(self.now + delay, event);
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|s| s.at)
    }

    pub fn pop(&mut self) -> Option<(SimTime, E)> {
        let next = self.heap.pop()?;
        self.now = next.at;
        Some((next.at, next.event))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_pop_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_millis(30), "c");
        queue.schedule(SimTime::from_millis(10), "a");
        queue.schedule(SimTime::from_millis(20), "b");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, e)| e).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(queue.now(), SimTime::from_millis(30));
    }

    #[test]
    fn test_simultaneous_events_keep_insertion_order() {
        let mut queue = EventQueue::new();
        for i in 0..5 {
            queue.schedule(SimTime::from_millis(10), i);
        }
        queue.schedule(SimTime::from_millis(5), 99);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, e)| e).collect();
        assert_eq!(order, vec![99, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_relative_scheduling_and_past_clamp() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_millis(10), 1);
        assert_eq!(queue.pop(), Some((SimTime::from_millis(10), 1)));

        queue.schedule_in(Duration::from_millis(5), 2);
        queue.schedule(SimTime::from_millis(1), 3);
        assert_eq!(queue.peek_time(), Some(SimTime::from_millis(10)));
        assert_eq!(queue.pop(), Some((SimTime::from_millis(10), 3)));
        assert_eq!(queue.pop(), Some((SimTime::from_millis(15), 2)));
        assert!(queue.is_empty());
    }
}
