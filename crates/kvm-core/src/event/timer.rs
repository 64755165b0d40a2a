//! Timer bookkeeping for the event queue.
//!
//! A [`TimerQueue`] is a binary min-heap of [`Timer`]s ordered by remaining
//! time.  Remaining time is signed: a timer that the loop noticed late goes
//! negative, and the overshoot determines the `count` reported when it fires.
//!
//! The queue never reads a clock.  The owner measures elapsed time and calls
//! [`TimerQueue::elapse`], which subtracts the same amount from every timer
//! and therefore never disturbs the heap order.

use std::time::Duration;

use super::types::{EventTarget, TimerEvent, TimerHandle};

/// Converts a duration to signed nanoseconds, saturating on overflow.
pub(crate) fn as_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// A single periodic or one-shot timer.
#[derive(Debug, Clone)]
pub struct Timer {
    handle: TimerHandle,
    target: EventTarget,
    timeout: i64,
    remaining: i64,
    one_shot: bool,
}

impl Timer {
    /// Creates a timer whose first expiry is `initial` from now.
    pub fn new(
        handle: TimerHandle,
        timeout: Duration,
        initial: Duration,
        target: EventTarget,
        one_shot: bool,
    ) -> Self {
        Self {
            handle,
            target,
            timeout: as_nanos(timeout).max(1),
            remaining: as_nanos(initial),
            one_shot,
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle
    }

    pub fn target(&self) -> EventTarget {
        self.target
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    /// Remaining time clamped at zero.
    pub fn remaining(&self) -> Duration {
        Duration::from_nanos(u64::try_from(self.remaining).unwrap_or(0))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining <= 0
    }

    /// Builds the `Timer` event payload: the number of whole periods elapsed.
    pub fn fire(&self) -> TimerEvent {
        let overshoot = (self.timeout - self.remaining) / self.timeout;
        TimerEvent {
            timer: self.handle,
            count: u32::try_from(overshoot.max(1)).unwrap_or(u32::MAX),
        }
    }

    /// Restarts the countdown at one full period.
    pub fn reset(&mut self) {
        self.remaining = self.timeout;
    }

    fn elapse(&mut self, nanos: i64) {
        self.remaining = self.remaining.saturating_sub(nanos);
    }
}

/// Min-heap of timers keyed on remaining time.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: Vec<Timer>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { heap: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, timer: Timer) {
        self.heap.push(timer);
        self.sift_up(self.heap.len() - 1);
    }

    /// The timer that expires first.
    pub fn peek(&self) -> Option<&Timer> {
        self.heap.first()
    }

    pub fn pop(&mut self) -> Option<Timer> {
        if self.heap.is_empty() {
            return None;
        }
        let timer = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(timer)
    }

    /// Removes the timer with `handle`, if queued.
    pub fn remove(&mut self, handle: TimerHandle) -> Option<Timer> {
        let index = self.heap.iter().position(|timer| timer.handle == handle)?;
        let timer = self.heap.swap_remove(index);
        if index < self.heap.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
        Some(timer)
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.heap.iter().any(|timer| timer.handle == handle)
    }

    /// Subtracts `elapsed` from every timer.
    pub fn elapse(&mut self, elapsed: Duration) {
        let nanos = as_nanos(elapsed);
        if nanos == 0 {
            return;
        }
        for timer in &mut self.heap {
            timer.elapse(nanos);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].remaining >= self.heap[parent].remaining {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.heap[left].remaining < self.heap[smallest].remaining {
                smallest = left;
            }
            if right < len && self.heap[right].remaining < self.heap[smallest].remaining {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
