//! The central event queue.
//!
//! # How it works (for beginners)
//!
//! Every component talks to every other component by posting [`Event`]s to a
//! shared `Arc<EventQueue>`.  One thread (the "owning" or "loop" thread) calls
//! [`EventQueue::run_loop`], which repeatedly:
//!
//! 1. waits in [`EventQueue::get_event`] until an event is queued or the
//!    nearest timer expires, then
//! 2. hands the event to [`EventQueue::dispatch_event`], which looks up the
//!    handler registered for the `(type, target)` pair and calls it.
//!
//! Any thread may call [`EventQueue::add_event`].  Event bodies are parked in
//! a table keyed by a small integer id and only the id travels through the
//! [`EventQueueBuffer`], which is what actually wakes the loop thread.
//!
//! A single mutex guards the handler table, the timers, and the saved event
//! table.  It is never held while a handler runs, so handlers are free to add
//! events, register handlers, or create and delete timers (including their
//! own).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use super::buffer::{BufferEvent, EventQueueBuffer, SimpleEventQueueBuffer};
use super::timer::{Timer, TimerQueue};
use super::types::{Event, EventTarget, EventType, TimerHandle};
use crate::mt::lock;

/// A registered event handler.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EventQueueError {
    #[error("event queue is not ready within {0:?}")]
    NotReady(Duration),
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct QueueState {
    type_ids: HashMap<String, EventType>,
    type_names: Vec<String>,
    handlers: HashMap<EventTarget, HashMap<EventType, EventHandler>>,
    timers: HashSet<TimerHandle>,
    timer_queue: TimerQueue,
    last_check: Instant,
    saved: HashMap<u32, Event>,
    free_ids: Vec<u32>,
    next_id: u32,
}

impl QueueState {
    fn new() -> Self {
        let mut state = Self {
            type_ids: HashMap::new(),
            type_names: Vec::new(),
            handlers: HashMap::new(),
            timers: HashSet::new(),
            timer_queue: TimerQueue::new(),
            last_check: Instant::now(),
            saved: HashMap::new(),
            free_ids: Vec::new(),
            next_id: 0,
        };
        for name in ["Unknown", "Quit", "System", "Timer"] {
            state.type_names.push(name.to_string());
        }
        state
    }

    fn save_event(&mut self, event: Event) -> u32 {
        let id = self.free_ids.pop().unwrap_or_else(|| {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            id
        });
        self.saved.insert(id, event);
        id
    }

    fn remove_event(&mut self, id: u32) -> Option<Event> {
        let event = self.saved.remove(&id)?;
        self.free_ids.push(id);
        Some(event)
    }

    /// Advances every timer by the time since the last check.
    fn advance_timers(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_check);
        self.last_check = now;
        self.timer_queue.elapse(elapsed);
    }

    fn handler_for(&self, kind: EventType, target: EventTarget) -> Option<EventHandler> {
        let by_type = self.handlers.get(&target)?;
        by_type
            .get(&kind)
            .or_else(|| by_type.get(&EventType::UNKNOWN))
            .cloned()
    }
}

struct Pending {
    ready: bool,
    events: VecDeque<Event>,
}

// ── EventQueue ────────────────────────────────────────────────────────────────

pub struct EventQueue {
    state: Mutex<QueueState>,
    buffer: RwLock<Arc<dyn EventQueueBuffer>>,
    pending: Mutex<Pending>,
    ready_changed: Condvar,
    system_target: EventTarget,
}

impl EventQueue {
    /// Creates a queue backed by a [`SimpleEventQueueBuffer`].
    pub fn new() -> Arc<Self> {
        Self::with_buffer(Arc::new(SimpleEventQueueBuffer::new()))
    }

    pub fn with_buffer(buffer: Arc<dyn EventQueueBuffer>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::new()),
            buffer: RwLock::new(buffer),
            pending: Mutex::new(Pending {
                ready: false,
                events: VecDeque::new(),
            }),
            ready_changed: Condvar::new(),
            system_target: EventTarget::allocate(),
        })
    }

    /// Target for process-wide events such as configuration reloads.
    pub fn system_target(&self) -> EventTarget {
        self.system_target
    }

    // ── Event types ───────────────────────────────────────────────────────────

    /// Returns the type registered under `name`, allocating it on first use.
    pub fn register_type(&self, name: &str) -> EventType {
        let mut state = lock(&self.state);
        if let Some(&kind) = state.type_ids.get(name) {
            return kind;
        }
        let id = u32::try_from(state.type_names.len())
            .unwrap_or(u32::MAX)
            .max(EventType::FIRST_DYNAMIC);
        let kind = EventType::from_id(id);
        state.type_ids.insert(name.to_string(), kind);
        state.type_names.push(name.to_string());
        trace!("registered event type {name} as {id}");
        kind
    }

    /// Human-readable name of `kind`, for diagnostics.
    pub fn type_name(&self, kind: EventType) -> String {
        lock(&self.state)
            .type_names
            .get(kind.id() as usize)
            .cloned()
            .unwrap_or_else(|| format!("<type {}>", kind.id()))
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Installs `handler` for `(kind, target)`, dropping any previous one.
    pub fn adopt_handler<F>(&self, kind: EventType, target: EventTarget, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let previous = lock(&self.state)
            .handlers
            .entry(target)
            .or_default()
            .insert(kind, Arc::new(handler));
        // Dropped outside the lock: a handler's captures may own queue clients.
        drop(previous);
    }

    pub fn remove_handler(&self, kind: EventType, target: EventTarget) {
        let removed = {
            let mut state = lock(&self.state);
            let removed = state
                .handlers
                .get_mut(&target)
                .and_then(|by_type| by_type.remove(&kind));
            if state.handlers.get(&target).is_some_and(HashMap::is_empty) {
                state.handlers.remove(&target);
            }
            removed
        };
        drop(removed);
    }

    /// Removes every handler registered for `target`.
    pub fn remove_handlers(&self, target: EventTarget) {
        let removed = lock(&self.state).handlers.remove(&target);
        drop(removed);
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Creates a repeating timer.  With no `target` the timer's own handle is
    /// the target of its events.
    pub fn new_timer(&self, duration: Duration, target: Option<EventTarget>) -> TimerHandle {
        self.insert_timer(duration, target, false)
    }

    pub fn new_one_shot_timer(&self, duration: Duration, target: Option<EventTarget>) -> TimerHandle {
        self.insert_timer(duration, target, true)
    }

    fn insert_timer(&self, duration: Duration, target: Option<EventTarget>, one_shot: bool) -> TimerHandle {
        debug_assert!(!duration.is_zero(), "timer duration must be positive");
        let handle = TimerHandle::allocate();
        let target = target.unwrap_or_else(|| handle.target());
        {
            let mut state = lock(&self.state);
            // The next expiry check subtracts the time since the last one, so
            // start the countdown that much higher.
            let initial = duration + state.last_check.elapsed();
            state
                .timer_queue
                .push(Timer::new(handle, duration, initial, target, one_shot));
            state.timers.insert(handle);
        }
        handle
    }

    /// Cancels a timer.  No-op for unknown or already-fired one-shot timers.
    pub fn delete_timer(&self, handle: TimerHandle) {
        let mut state = lock(&self.state);
        state.timer_queue.remove(handle);
        state.timers.remove(&handle);
    }

    pub fn timer_count(&self) -> usize {
        lock(&self.state).timers.len()
    }

    fn next_timer_timeout(&self) -> Option<Duration> {
        lock(&self.state).timer_queue.peek().map(Timer::remaining)
    }

    fn expired_timer_event(&self) -> Option<Event> {
        let mut state = lock(&self.state);
        if state.timer_queue.is_empty() {
            return None;
        }
        state.advance_timers();
        if !state.timer_queue.peek().is_some_and(Timer::is_expired) {
            return None;
        }
        let mut timer = state.timer_queue.pop()?;
        let event = Event::timer(timer.target(), timer.fire());
        if timer.is_one_shot() {
            state.timers.remove(&timer.handle());
        } else {
            timer.reset();
            state.timer_queue.push(timer);
        }
        Some(event)
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    /// Marks the queue ready and moves the events queued before the loop
    /// started into the buffer.  The pending lock is held until they are all
    /// in, so a concurrent `add_event` cannot overtake them.
    fn ensure_ready(&self) {
        let mut pending = lock(&self.pending);
        if pending.ready {
            return;
        }
        self.buffer().init();
        let flushed = std::mem::take(&mut pending.events);
        if !flushed.is_empty() {
            debug!("flushing {} events queued before the loop started", flushed.len());
        }
        for event in flushed {
            self.add_event_to_buffer(event);
        }
        pending.ready = true;
        self.ready_changed.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.pending).ready
    }

    /// Blocks until the loop thread has started servicing the queue.
    ///
    /// # Errors
    ///
    /// Returns [`EventQueueError::NotReady`] if that does not happen within
    /// `timeout`.
    pub fn wait_for_ready(&self, timeout: Duration) -> Result<(), EventQueueError> {
        let pending = lock(&self.pending);
        let (pending, _) = self
            .ready_changed
            .wait_timeout_while(pending, timeout, |pending| !pending.ready)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.ready {
            Ok(())
        } else {
            Err(EventQueueError::NotReady(timeout))
        }
    }

    // ── Buffer ────────────────────────────────────────────────────────────────

    fn buffer(&self) -> Arc<dyn EventQueueBuffer> {
        Arc::clone(&self.buffer.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Replaces the platform buffer.  Events queued in the old buffer are
    /// discarded.
    pub fn adopt_buffer(&self, buffer: Arc<dyn EventQueueBuffer>) {
        let discarded = {
            let mut state = lock(&self.state);
            state.free_ids.clear();
            state.next_id = 0;
            std::mem::take(&mut state.saved)
        };
        if !discarded.is_empty() {
            debug!("discarded {} queued events while replacing the buffer", discarded.len());
        }
        *self.buffer.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::clone(&buffer);
        if self.is_ready() {
            buffer.init();
        }
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Queues `event` for the loop thread.  Callable from any thread.
    ///
    /// `Unknown`, `System` and `Timer` typed events are discarded.
    pub fn add_event(&self, event: Event) {
        if event.kind().is_internal() {
            trace!("discarding event of reserved type {}", event.kind().id());
            return;
        }
        {
            let mut pending = lock(&self.pending);
            if !pending.ready {
                pending.events.push_back(event);
                return;
            }
        }
        self.add_event_to_buffer(event);
    }

    fn add_event_to_buffer(&self, event: Event) {
        let mut state = lock(&self.state);
        let id = state.save_event(event);
        if !self.buffer().add_event(id) {
            state.remove_event(id);
            debug!("buffer rejected event {id}");
        }
    }

    /// Returns `true` when no event is queued and no timer has expired.
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty() && self.next_timer_timeout() != Some(Duration::ZERO)
    }

    /// Returns the next event, waiting up to `timeout` (`None` = forever).
    ///
    /// Expired timers are reported before queued events, so a busy queue
    /// cannot starve them.
    pub fn get_event(&self, timeout: Option<Duration>) -> Option<Event> {
        self.ensure_ready();
        let started = Instant::now();
        loop {
            let buffer = self.buffer();
            while buffer.is_empty() {
                if let Some(event) = self.expired_timer_event() {
                    return Some(event);
                }
                let time_left = match timeout {
                    Some(timeout) => {
                        let left = timeout.saturating_sub(started.elapsed());
                        if left.is_zero() {
                            return None;
                        }
                        Some(left)
                    }
                    None => None,
                };
                let wait = match (time_left, self.next_timer_timeout()) {
                    (Some(left), Some(next)) => Some(left.min(next)),
                    (left, next) => left.or(next),
                };
                buffer.wait_for_event(wait);
            }

            if let Some(event) = self.expired_timer_event() {
                return Some(event);
            }

            match buffer.get_event() {
                BufferEvent::System(event) => return Some(event),
                BufferEvent::User(id) => {
                    if let Some(event) = lock(&self.state).remove_event(id) {
                        return Some(event);
                    }
                }
                BufferEvent::None => {}
            }
            if timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
                return None;
            }
        }
    }

    /// Runs the handler for `event`.  Returns `false` if none is registered.
    ///
    /// The event is consumed, so its owned payload is dropped exactly once,
    /// after the handler returns.
    pub fn dispatch_event(&self, event: Event) -> bool {
        let handler = lock(&self.state).handler_for(event.kind(), event.target());
        match handler {
            Some(handler) => {
                handler(&event);
                true
            }
            None => false,
        }
    }

    /// Dispatches events until a `Quit` event is read.
    ///
    /// The `Quit` event itself is not dispatched.
    pub fn run_loop(&self) {
        self.ensure_ready();
        loop {
            let Some(event) = self.get_event(None) else {
                continue;
            };
            if event.is_quit() {
                debug!("event loop received quit");
                return;
            }
            let kind = event.kind();
            if !self.dispatch_event(event) {
                trace!("no handler for event type {}", kind.id());
            }
        }
    }

    /// Adds a `Quit` event.
    pub fn quit(&self) {
        self.add_event(Event::quit());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
