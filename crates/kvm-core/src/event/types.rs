//! Event values: the type tag, the target identity, and the payload.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── EventType ─────────────────────────────────────────────────────────────────

/// Small-integer tag naming the kind of an event.
///
/// Four values are reserved and always registered.  Every other type is
/// allocated at runtime by [`EventQueue::register_type`](super::EventQueue::register_type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(u32);

impl EventType {
    /// Fallback key: a handler registered under `UNKNOWN` receives every event
    /// for its target that has no type-specific handler.  Never enqueued.
    pub const UNKNOWN: Self = Self(0);
    /// Terminates [`EventQueue::run_loop`](super::EventQueue::run_loop).
    pub const QUIT: Self = Self(1);
    /// Platform-level event delivered by a buffer.  Never enqueued by user code.
    pub const SYSTEM: Self = Self(2);
    /// Produced only by the queue when a timer fires.
    pub const TIMER: Self = Self(3);

    pub(crate) const FIRST_DYNAMIC: u32 = 4;

    pub(crate) const fn from_id(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// Returns `true` for the types user code may not enqueue.
    pub fn is_internal(self) -> bool {
        matches!(self, Self::UNKNOWN | Self::SYSTEM | Self::TIMER)
    }
}

// ── EventTarget ───────────────────────────────────────────────────────────────

static NEXT_TARGET: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of an object that receives events.
///
/// Targets are process-unique values handed out by [`EventTarget::allocate`];
/// the queue never dereferences them, it only uses them as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTarget(u64);

impl EventTarget {
    /// The "no particular target" identity.  `Quit` is usually sent here.
    pub const NONE: Self = Self(0);

    /// Allocates a fresh, never-before-used target.
    pub fn allocate() -> Self {
        Self(NEXT_TARGET.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Timers ────────────────────────────────────────────────────────────────────

/// Handle returned by [`EventQueue::new_timer`](super::EventQueue::new_timer).
///
/// The handle doubles as an event target: a timer created without an explicit
/// target delivers its events to `handle.target()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(EventTarget);

impl TimerHandle {
    pub(crate) fn allocate() -> Self {
        Self(EventTarget::allocate())
    }

    pub fn target(self) -> EventTarget {
        self.0
    }
}

/// Payload of a `Timer` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub timer: TimerHandle,
    /// Whole periods elapsed since the timer last fired (at least 1).
    pub count: u32,
}

// ── Event ─────────────────────────────────────────────────────────────────────

/// Payload carried by an [`Event`].
pub enum EventData {
    None,
    /// Dropped together with the event.
    Owned(Box<dyn Any + Send>),
    /// Shared with the sender, which keeps its own reference.
    Shared(Arc<dyn Any + Send + Sync>),
    Timer(TimerEvent),
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Owned(_) => f.write_str("Owned(..)"),
            Self::Shared(_) => f.write_str("Shared(..)"),
            Self::Timer(timer) => f.debug_tuple("Timer").field(timer).finish(),
        }
    }
}

/// A typed, targeted message with an optional payload.
///
/// Events are moved, never cloned: whoever holds the value owns the payload,
/// and [`EventQueue::dispatch_event`](super::EventQueue::dispatch_event)
/// consumes it, so each event reaches at most one handler invocation.
#[derive(Debug)]
pub struct Event {
    kind: EventType,
    target: EventTarget,
    data: EventData,
}

impl Event {
    pub fn new(kind: EventType, target: EventTarget) -> Self {
        Self {
            kind,
            target,
            data: EventData::None,
        }
    }

    /// An event whose payload is owned by the event.
    pub fn with_data<T: Any + Send>(kind: EventType, target: EventTarget, data: T) -> Self {
        Self {
            kind,
            target,
            data: EventData::Owned(Box::new(data)),
        }
    }

    /// An event whose payload outlives it.
    pub fn with_shared<T: Any + Send + Sync>(
        kind: EventType,
        target: EventTarget,
        data: Arc<T>,
    ) -> Self {
        Self {
            kind,
            target,
            data: EventData::Shared(data),
        }
    }

    /// A `Quit` event addressed to no particular target.
    pub fn quit() -> Self {
        Self::new(EventType::QUIT, EventTarget::NONE)
    }

    pub(crate) fn timer(target: EventTarget, timer: TimerEvent) -> Self {
        Self {
            kind: EventType::TIMER,
            target,
            data: EventData::Timer(timer),
        }
    }

    pub fn kind(&self) -> EventType {
        self.kind
    }

    pub fn target(&self) -> EventTarget {
        self.target
    }

    pub fn is_quit(&self) -> bool {
        self.kind == EventType::QUIT
    }

    pub fn raw_data(&self) -> &EventData {
        &self.data
    }

    /// Borrows the payload as `T`, whether owned or shared.
    pub fn data<T: Any>(&self) -> Option<&T> {
        match &self.data {
            EventData::Owned(data) => data.downcast_ref::<T>(),
            EventData::Shared(data) => data.downcast_ref::<T>(),
            EventData::None | EventData::Timer(_) => None,
        }
    }

    /// Clones the shared payload handle as `Arc<T>`.
    pub fn shared<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &self.data {
            EventData::Shared(data) => Arc::clone(data).downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn timer_event(&self) -> Option<&TimerEvent> {
        match &self.data {
            EventData::Timer(timer) => Some(timer),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
