//! Cooperative thread cancellation.
//!
//! Cancellation is a request, not an interruption: [`CancellationToken::cancel`]
//! sets a flag and runs the registered unblock hooks (for example waking a
//! `mio::Poll`).  The worker observes the flag at its own cancellation points
//! via [`CancellationToken::check`] and unwinds by returning `Err(Cancelled)`
//! with `?`.
//!
//! `Cancelled` is its own error type rather than a variant of some broader
//! enum so that a generic `match` over I/O or protocol errors cannot swallow it
//! by accident.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::lock;

/// Returned from a cancellation point once the owning thread has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread cancelled")]
pub struct Cancelled;

type UnblockHook = Box<dyn Fn() + Send + Sync>;

struct TokenInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<UnblockHook>>,
    sleep_lock: Mutex<()>,
    sleepers: Condvar,
}

/// A shareable cancellation flag with unblock hooks.
///
/// Clones observe the same flag.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
                sleep_lock: Mutex::new(()),
                sleepers: Condvar::new(),
            }),
        }
    }

    /// Requests cancellation and runs every unblock hook.
    ///
    /// Idempotent: hooks run only on the first call.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = lock(&self.inner.sleep_lock);
            self.inner.sleepers.notify_all();
        }
        let hooks = std::mem::take(&mut *lock(&self.inner.hooks));
        for hook in &hooks {
            hook();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancellation point: `Err(Cancelled)` once cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the token has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers a hook that unblocks the owning thread when cancelled.
    ///
    /// Runs the hook immediately if the token is already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut hooks = lock(&self.inner.hooks);
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Sleeps for `duration`, waking early on cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the token is cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut guard = lock(&self.inner.sleep_lock);
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            guard = self
                .inner
                .sleepers
                .wait_timeout(guard, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
    }

    #[test]
    fn test_cancel_is_visible_through_clones() {
        // Arrange
        let token = CancellationToken::new();
        let clone = token.clone();

        // Act
        token.cancel();

        // Assert
        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(Cancelled));
    }

    #[test]
    fn test_hooks_run_once_even_if_cancelled_twice() {
        // Arrange
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Act
        token.cancel();
        token.cancel();

        // Assert
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_registered_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        token.on_cancel(move || flag.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sleep_returns_cancelled_when_woken_early() {
        // Arrange
        let token = CancellationToken::new();
        let canceller = token.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        // Act
        let result = token.sleep(Duration::from_secs(10));
        handle.join().unwrap();

        // Assert
        assert_eq!(result, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_completes_without_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(token.sleep(Duration::from_millis(5)), Ok(()));
    }
}
