//! The event queue's pluggable wake-up buffer.
//!
//! The queue stores event bodies itself and passes only small integer ids
//! through the buffer.  A buffer's job is to deliver those ids (plus any
//! platform "system" events it produces) and to block the loop thread until
//! something arrives.  The default [`SimpleEventQueueBuffer`] is an in-memory
//! FIFO with a condition variable; a platform integration can substitute its
//! own through [`EventQueue::adopt_buffer`](super::EventQueue::adopt_buffer).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::types::Event;
use crate::mt::lock;

/// What a buffer yielded.
#[derive(Debug)]
pub enum BufferEvent {
    /// Nothing available (spurious wake-up or timeout).
    None,
    /// A platform event, returned to the caller as-is.
    System(Event),
    /// Id of an event saved in the queue.
    User(u32),
}

pub trait EventQueueBuffer: Send + Sync {
    /// Called once, on the loop thread, when the queue becomes ready.
    fn init(&self) {}

    /// Blocks until the buffer is non-empty or `timeout` elapses.
    /// `None` waits without limit.
    fn wait_for_event(&self, timeout: Option<Duration>);

    fn get_event(&self) -> BufferEvent;

    /// Returns `false` if the id could not be queued; the caller then
    /// discards the saved event.
    fn add_event(&self, id: u32) -> bool;

    fn is_empty(&self) -> bool;
}

/// In-memory FIFO of event ids.
#[derive(Debug, Default)]
pub struct SimpleEventQueueBuffer {
    queue: Mutex<VecDeque<u32>>,
    ready: Condvar,
}

impl SimpleEventQueueBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventQueueBuffer for SimpleEventQueueBuffer {
    fn wait_for_event(&self, timeout: Option<Duration>) {
        let queue = lock(&self.queue);
        if !queue.is_empty() {
            return;
        }
        match timeout {
            Some(timeout) => {
                drop(self.ready.wait_timeout_while(queue, timeout, |queue| queue.is_empty()));
            }
            None => {
                drop(self.ready.wait_while(queue, |queue| queue.is_empty()));
            }
        }
    }

    fn get_event(&self) -> BufferEvent {
        match lock(&self.queue).pop_front() {
            Some(id) => BufferEvent::User(id),
            None => BufferEvent::None,
        }
    }

    fn add_event(&self, id: u32) -> bool {
        lock(&self.queue).push_back(id);
        self.ready.notify_one();
        true
    }

    fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_ids_come_out_in_fifo_order() {
        let buffer = SimpleEventQueueBuffer::new();
        buffer.add_event(3);
        buffer.add_event(1);

        assert!(matches!(buffer.get_event(), BufferEvent::User(3)));
        assert!(matches!(buffer.get_event(), BufferEvent::User(1)));
        assert!(matches!(buffer.get_event(), BufferEvent::None));
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let buffer = SimpleEventQueueBuffer::new();
        let started = Instant::now();

        buffer.wait_for_event(Some(Duration::from_millis(20)));

        assert!(started.elapsed() >= Duration::from_millis(15));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_add_from_other_thread_wakes_waiter() {
        // Arrange
        let buffer = Arc::new(SimpleEventQueueBuffer::new());
        let producer = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.add_event(9);
        });

        // Act
        buffer.wait_for_event(None);
        handle.join().unwrap();

        // Assert
        assert!(matches!(buffer.get_event(), BufferEvent::User(9)));
    }
}
