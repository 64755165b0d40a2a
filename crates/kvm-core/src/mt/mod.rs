//! Concurrency primitives shared by the event queue, the socket multiplexer,
//! and the watcher threads.
//!
//! # What lives here? (for beginners)
//!
//! - **`cancel`** – [`CancellationToken`], a cooperative cancellation flag.
//!   Long-running loops call [`CancellationToken::check`] at well-defined
//!   points and return `Err(Cancelled)` when asked to stop.  Blocking calls
//!   are unblocked through hooks registered with
//!   [`CancellationToken::on_cancel`].
//!
//! - **`thread`** – [`WorkerThread`], a named OS thread that owns a
//!   cancellation token and is cancelled and joined when dropped.
//!
//! - **`arena`** – [`Arena`], a generation-counted handle table.  Values are
//!   stored by index instead of by pointer, so a stale index can never reach
//!   a recycled slot.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod arena;
pub mod cancel;
pub mod thread;

pub use arena::{Arena, ArenaIndex};
pub use cancel::{CancellationToken, Cancelled};
pub use thread::WorkerThread;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every structure guarded this way stays consistent between statements, so
/// a poisoned lock carries no torn state worth refusing.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
