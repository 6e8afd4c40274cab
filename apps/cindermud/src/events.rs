//! Deferred work queue. Callbacks are scheduled a number of pulses ahead
//! and run when the loop reaches their due pulse. Ties on the same pulse
//! fire in insertion order. An event may carry an owner token; the caller
//! checks owner liveness before running and drops events whose owner is
//! gone, so dead sessions and characters never have code run on their
//! behalf.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::session::SessionId;
use crate::world::CharId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Session(SessionId),
    Char(CharId),
}

/// What a callback wants next: done, or run again after a delay in pulses.
pub enum Outcome {
    Finished,
    Redeliver(u64),
}

pub type EventFn<C> = Box<dyn FnMut(&mut C) -> Outcome>;

pub struct Event<C> {
    due: u64,
    seq: u64,
    pub owner: Option<Owner>,
    pub label: &'static str,
    pub run: EventFn<C>,
}

impl<C> PartialEq for Event<C> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<C> Eq for Event<C> {}

impl<C> PartialOrd for Event<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Event<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

pub struct EventQueue<C> {
    heap: BinaryHeap<Reverse<Event<C>>>,
    seq: u64,
    pub scheduled: u64,
    pub executed: u64,
    pub dropped: u64,
}

impl<C> EventQueue<C> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            scheduled: 0,
            executed: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedule `run` for `delay` pulses after `now`. A delay of zero fires
    /// in the current processing pass.
    pub fn schedule(
        &mut self,
        now: u64,
        delay: u64,
        owner: Option<Owner>,
        label: &'static str,
        run: EventFn<C>,
    ) {
        let seq = self.seq;
        self.seq += 1;
        self.scheduled += 1;
        self.heap.push(Reverse(Event {
            due: now + delay,
            seq,
            owner,
            label,
            run,
        }));
    }

    /// Put a popped event back with a fresh due pulse, keeping its original
    /// insertion rank for same-pulse ordering.
    pub fn requeue(&mut self, mut ev: Event<C>, due: u64) {
        ev.due = due;
        self.heap.push(Reverse(ev));
    }

    pub fn pop_due(&mut self, now: u64) -> Option<Event<C>> {
        if self.heap.peek().is_some_and(|Reverse(ev)| ev.due <= now) {
            self.heap.pop().map(|Reverse(ev)| ev)
        } else {
            None
        }
    }

    /// Remove every pending event held by `owner`. Returns how many were
    /// cancelled.
    pub fn cancel_owner(&mut self, owner: Owner) -> usize {
        let before = self.heap.len();
        let kept: Vec<Reverse<Event<C>>> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter(|Reverse(ev)| ev.owner != Some(owner))
            .collect();
        self.heap = kept.into();
        let cancelled = before - self.heap.len();
        self.dropped += cancelled as u64;
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut EventQueue<Vec<&'static str>>, now: u64, log: &mut Vec<&'static str>) {
        while let Some(mut ev) = q.pop_due(now) {
            match (ev.run)(log) {
                Outcome::Finished => {}
                Outcome::Redeliver(delay) => q.requeue(ev, now + delay.max(1)),
            }
        }
    }

    #[test]
    fn fires_in_due_order() {
        let mut q: EventQueue<Vec<&'static str>> = EventQueue::new();
        q.schedule(0, 3, None, "late", Box::new(|log| {
            log.push("late");
            Outcome::Finished
        }));
        q.schedule(0, 1, None, "early", Box::new(|log| {
            log.push("early");
            Outcome::Finished
        }));
        let mut log = Vec::new();
        for now in 0..=3 {
            drain(&mut q, now, &mut log);
        }
        assert_eq!(log, vec!["early", "late"]);
    }

    #[test]
    fn same_pulse_runs_in_insertion_order() {
        let mut q: EventQueue<Vec<&'static str>> = EventQueue::new();
        for name in ["a", "b", "c"] {
            q.schedule(0, 2, None, name, Box::new(move |log: &mut Vec<&'static str>| {
                log.push(name);
                Outcome::Finished
            }));
        }
        let mut log = Vec::new();
        drain(&mut q, 2, &mut log);
        assert_eq!(log, vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_delay_fires_in_current_pass() {
        let mut q: EventQueue<Vec<&'static str>> = EventQueue::new();
        q.schedule(5, 0, None, "now", Box::new(|log| {
            log.push("now");
            Outcome::Finished
        }));
        let mut log = Vec::new();
        drain(&mut q, 5, &mut log);
        assert_eq!(log, vec!["now"]);
    }

    #[test]
    fn redelivered_event_runs_again() {
        let mut q: EventQueue<Vec<&'static str>> = EventQueue::new();
        let mut remaining = 3;
        q.schedule(0, 1, None, "tick", Box::new(move |log| {
            log.push("tick");
            remaining -= 1;
            if remaining == 0 {
                Outcome::Finished
            } else {
                Outcome::Redeliver(1)
            }
        }));
        let mut log = Vec::new();
        for now in 0..10 {
            drain(&mut q, now, &mut log);
        }
        assert_eq!(log, vec!["tick", "tick", "tick"]);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_owner_removes_only_their_events() {
        let mut q: EventQueue<Vec<&'static str>> = EventQueue::new();
        let mine = Owner::Session(SessionId(7));
        let theirs = Owner::Session(SessionId(8));
        q.schedule(0, 1, Some(mine), "mine", Box::new(|log| {
            log.push("mine");
            Outcome::Finished
        }));
        q.schedule(0, 1, Some(theirs), "theirs", Box::new(|log| {
            log.push("theirs");
            Outcome::Finished
        }));
        assert_eq!(q.cancel_owner(mine), 1);
        let mut log = Vec::new();
        drain(&mut q, 1, &mut log);
        assert_eq!(log, vec!["theirs"]);
    }
}
