//! # kvm-core
//!
//! The event-driven coordination engine shared by the KVM-Over-IP server and
//! client: the event queue, the socket multiplexer, and the plumbing both
//! session state machines are built on.
//!
//! # Architecture overview (for beginners)
//!
//! KVM-Over-IP lets one computer's keyboard and mouse control other computers
//! on the network.  Capturing and injecting input is thin platform code; the
//! hard part is keeping a long-lived, failure-prone network session healthy
//! while several threads cooperate.  This crate provides the pieces for that:
//!
//! - **`event`** – The [`EventQueue`].  Every component communicates by
//!   posting [`Event`]s to it; one thread runs the loop and dispatches each
//!   event to the handler registered for its `(type, target)` pair.  Timers
//!   are scheduled through the queue too.
//!
//! - **`net`** – The [`SocketMultiplexer`], a service thread that waits on all
//!   sockets at once and runs a [`SocketJob`] for each ready one.  Jobs report
//!   what happened by adding events to the queue.
//!
//! - **`mt`** – Threading helpers: cooperative cancellation, named worker
//!   threads, and a generation-counted handle arena.
//!
//! - **`screen`** – The screen collaborator trait that sessions open and
//!   watch.
//!
//! - **`ipc`** – A watcher thread that turns local control requests and
//!   process signals into events.
//!
//! - **`exit`** – Exit codes shared by the binaries.
//!
//! Nothing here owns session state.  The server and client crates register
//! handlers on the queue; those handlers run one at a time on the loop thread.

pub mod event;
pub mod exit;
pub mod ipc;
pub mod mt;
pub mod net;
pub mod screen;

// Re-export the most-used types at the crate root so callers can write
// `kvm_core::EventQueue` instead of `kvm_core::event::queue::EventQueue`.
pub use event::{Event, EventQueue, EventTarget, EventType, TimerHandle};
pub use mt::{CancellationToken, Cancelled};
pub use net::{SocketError, SocketJob, SocketMultiplexer};
pub use screen::{Screen, ScreenError, ScreenFactory};
