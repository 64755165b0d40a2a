//! Named worker threads with cooperative cancellation.

use std::io;
use std::thread::JoinHandle;

use tracing::{debug, error};

use super::cancel::{CancellationToken, Cancelled};

/// An OS thread that runs a cancellable body.
///
/// The body receives the thread's [`CancellationToken`] and is expected to
/// return `Err(Cancelled)` from its cancellation points.  Dropping the handle
/// cancels the thread and joins it.
pub struct WorkerThread {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns a thread named `name` running `body`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(CancellationToken) -> Result<(), Cancelled> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || match body(thread_token) {
                Ok(()) => debug!("thread {thread_name} exited"),
                Err(Cancelled) => debug!("thread {thread_name} cancelled"),
            })?;
        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token the body observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the body has returned (or unwound).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Joins the thread.
    ///
    /// Returns `false` if the body panicked.  Later calls return `true`.
    pub fn wait(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(()) => true,
                Err(_) => {
                    error!("thread {} terminated by panic", self.name);
                    false
                }
            },
            None => true,
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_cancel_stops_cooperative_loop() {
        // Arrange
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&iterations);
        let mut thread = WorkerThread::spawn("test-worker", move |token| loop {
            token.check()?;
            counter.fetch_add(1, Ordering::SeqCst);
            token.sleep(Duration::from_millis(1))?;
        })
        .expect("spawn");

        // Act
        std::thread::sleep(Duration::from_millis(20));
        thread.cancel();
        let clean = thread.wait();

        // Assert
        assert!(clean);
        assert!(thread.is_finished());
        assert!(iterations.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_wait_reports_panicking_body() {
        let mut thread = WorkerThread::spawn("test-panic", |_token| -> Result<(), Cancelled> {
            panic!("boom");
        })
        .expect("spawn");

        assert!(!thread.wait());
    }

    #[test]
    fn test_drop_cancels_and_joins() {
        let exited = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&exited);
        {
            let _thread = WorkerThread::spawn("test-drop", move |token| {
                let result = token.sleep(Duration::from_secs(30));
                flag.fetch_add(1, Ordering::SeqCst);
                result
            })
            .expect("spawn");
        }
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_name_is_preserved() {
        let thread = WorkerThread::spawn("named", |_token| Ok(())).expect("spawn");
        assert_eq!(thread.name(), "named");
    }
}
