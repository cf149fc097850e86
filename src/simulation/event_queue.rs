//! Discrete-event queue with cancellable handles.
//!
//! Events are ordered by `(time, class, insertion order)`. The class lets
//! events sharing a timestamp run in a fixed order (radio notifications
//! before timers, timers before new traffic); within a class, first
//! scheduled runs first.

use embassy_time::Instant;
use log::error;
use std::collections::{BTreeMap, HashMap};

use crate::mac::TimerHandle;

type EventKey = (Instant, u8, u64);

pub struct EventQueue<E> {
    now: Instant,
    next_seq: u64,
    queue: BTreeMap<EventKey, E>,
    /// Sequence number -> key of every event still queued.
    pending: HashMap<u64, EventKey>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: Instant::from_ticks(0),
            next_seq: 0,
            queue: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Time of the event dispatched last.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue `event` at `at`. Times in the past are clamped to now.
    pub fn schedule(&mut self, at: Instant, class: u8, event: E) -> TimerHandle {
        let at = if at < self.now {
            error!("Event scheduled {} us in the past, running it now", (self.now - at).as_micros());
            self.now
        } else {
            at
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = (at, class, seq);
        self.queue.insert(key, event);
        self.pending.insert(seq, key);
        TimerHandle(seq)
    }

    /// Remove a queued event.
    ///
    /// Cancelling an event that already ran (or never existed) is a logic
    /// error in the caller.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.pending.remove(&handle.0) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => {
                error!("Cancelled unknown or fired timer {:?}", handle);
                if cfg!(debug_assertions) {
                    panic!("unknown timer {:?}", handle);
                }
                false
            }
        }
    }

    /// Time of the next event, if any.
    pub fn peek_time(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _, _)| *at)
    }

    /// Take the next event and advance the clock to its time.
    pub fn pop(&mut self) -> Option<(TimerHandle, Instant, E)> {
        let ((at, _, seq), event) = self.queue.pop_first()?;
        self.pending.remove(&seq);
        self.now = at;
        Some((TimerHandle(seq), at, event))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(micros: u64) -> Instant {
        Instant::from_micros(micros)
    }

    #[test]
    fn orders_by_time_then_class_then_insertion() {
        let mut queue = EventQueue::new();
        queue.schedule(us(20), 0, "late");
        queue.schedule(us(10), 3, "timer");
        queue.schedule(us(10), 0, "radio-1");
        queue.schedule(us(10), 4, "submit");
        queue.schedule(us(10), 0, "radio-2");

        let order: Vec<&str> = std::iter::from_fn(|| queue.pop().map(|(_, _, event)| event)).collect();
        assert_eq!(order, vec!["radio-1", "radio-2", "timer", "submit", "late"]);
        assert_eq!(queue.now(), us(20));
    }

    #[test]
    fn cancelled_events_never_fire() {
        let mut queue = EventQueue::new();
        let keep = queue.schedule(us(5), 0, 1);
        let drop = queue.schedule(us(6), 0, 2);
        assert!(queue.cancel(drop));
        assert_eq!(queue.len(), 1);
        let (handle, at, event) = queue.pop().unwrap();
        assert_eq!((handle, at, event), (keep, us(5), 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn handles_are_never_reused() {
        let mut queue = EventQueue::new();
        let first = queue.schedule(us(1), 0, ());
        queue.pop();
        let second = queue.schedule(us(2), 0, ());
        assert_ne!(first, second);
    }

    #[test]
    fn past_events_are_clamped_to_now() {
        let mut queue = EventQueue::new();
        queue.schedule(us(100), 0, 'a');
        queue.pop();
        queue.schedule(us(50), 0, 'b');
        assert_eq!(queue.peek_time(), Some(us(100)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unknown timer")]
    fn cancelling_a_fired_timer_is_a_logic_error() {
        let mut queue = EventQueue::new();
        let handle = queue.schedule(us(1), 0, ());
        queue.pop();
        queue.cancel(handle);
    }
}
