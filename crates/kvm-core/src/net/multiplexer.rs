//! The socket multiplexer service thread.
//!
//! # Locking (for beginners)
//!
//! The job list is guarded by a logical lock built from one mutex and three
//! condition variables, in two levels:
//!
//! 1. the **lock-out** (`lock_job_list_lock`): whoever wants the list first
//!    takes this.  It serialises the service thread against every adder and
//!    remover, so a steady stream of `add_socket` calls cannot starve the
//!    poll pass, and vice versa;
//! 2. the **list lock** (`lock_job_list`): exclusive access to the list
//!    itself.  The service thread holds it for a whole poll pass.
//!
//! A thread that wants to change the list takes the lock-out, wakes the
//! poller (which may be blocked holding the list lock), then takes the list
//! lock and releases the lock-out.  `unlock_job_list` recomputes whether
//! there is anything to poll and wakes the service thread if so.
//!
//! The underlying mutex is held only for short bookkeeping sections, never
//! while a job runs or while `mio` polls.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace, warn};

use super::job::{Readiness, SocketJob};
use super::job_list::{Entry, JobList};
use super::SocketError;
use crate::event::EventTarget;
use crate::exit::EXIT_FAILURE;
use crate::mt::{lock, ArenaIndex, CancellationToken, Cancelled, WorkerThread};

/// Upper bound on one poll; also bounds how long a remover can wait.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Called with a description when the service thread dies.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct JobListState {
    jobs: JobList,
    sockets: HashMap<EventTarget, ArenaIndex>,
    jobs_ready: bool,
    list_locked: bool,
    list_locker: Option<ThreadId>,
    lock_locked: bool,
    lock_locker: Option<ThreadId>,
    stopped: bool,
}

struct Shared {
    state: Mutex<JobListState>,
    jobs_ready_changed: Condvar,
    list_lock_changed: Condvar,
    lock_lock_changed: Condvar,
    registry: Registry,
    waker: Waker,
    passes: AtomicU64,
}

fn token_for(socket: EventTarget) -> Token {
    Token(usize::try_from(socket.id()).unwrap_or(usize::MAX - 1))
}

impl Shared {
    fn wait<'a>(&self, condvar: &Condvar, guard: MutexGuard<'a, JobListState>) -> MutexGuard<'a, JobListState> {
        condvar.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_job_list_lock(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        debug_assert_ne!(state.lock_locker, Some(me), "job list lock-out is not reentrant");
        while state.lock_locked {
            state = self.wait(&self.lock_lock_changed, state);
        }
        state.lock_locked = true;
        state.lock_locker = Some(me);
    }

    /// Takes the list lock and releases the lock-out.
    fn lock_job_list(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        debug_assert_eq!(state.lock_locker, Some(me), "lock-out must be held first");
        while state.list_locked {
            state = self.wait(&self.list_lock_changed, state);
        }
        state.list_locked = true;
        state.list_locker = Some(me);
        state.lock_locked = false;
        state.lock_locker = None;
        self.lock_lock_changed.notify_one();
    }

    fn unlock_job_list(&self) {
        let mut state = lock(&self.state);
        debug_assert_eq!(state.list_locker, Some(thread::current().id()));
        state.list_locked = false;
        state.list_locker = None;
        self.list_lock_changed.notify_one();
        state.jobs_ready = !state.jobs.is_empty();
        if state.jobs_ready {
            self.jobs_ready_changed.notify_one();
        }
    }

    /// Acquires the list on behalf of an adder or remover.
    fn acquire_list(&self) {
        self.lock_job_list_lock();
        if let Err(e) = self.waker.wake() {
            warn!("cannot wake socket multiplexer: {e}");
        }
        self.lock_job_list();
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        self.jobs_ready_changed.notify_all();
        drop(state);
        let _ = self.waker.wake();
    }

    /// Drops whatever locks the calling thread holds.  Used when the service
    /// thread unwinds out of a pass.
    fn release_held_locks(&self) {
        let me = Some(thread::current().id());
        let mut state = lock(&self.state);
        if state.list_locker == me {
            state.list_locked = false;
            state.list_locker = None;
            self.list_lock_changed.notify_all();
        }
        if state.lock_locker == me {
            state.lock_locked = false;
            state.lock_locker = None;
            self.lock_lock_changed.notify_all();
        }
    }

    /// Registers, re-registers, or deregisters `job`'s source for its current
    /// interest.
    fn arm(&self, socket: EventTarget, job: &mut dyn SocketJob) {
        let token = token_for(socket);
        let result = match job.interest() {
            Some(interest) => self
                .registry
                .reregister(job.source(), token, interest)
                .or_else(|_| self.registry.register(job.source(), token, interest)),
            None => self.registry.deregister(job.source()).or(Ok(())),
        };
        if let Err(e) = result {
            warn!("cannot arm socket {socket}: {e}");
        }
    }

    // ── Service thread ────────────────────────────────────────────────────────

    fn service(&self, mut poll: Poll, token: &CancellationToken) -> Result<(), Cancelled> {
        let mut events = Events::with_capacity(256);
        loop {
            token.check()?;
            {
                let mut state = lock(&self.state);
                while !state.jobs_ready && !state.stopped {
                    state = self.wait(&self.jobs_ready_changed, state);
                }
                if state.stopped {
                    return Err(Cancelled);
                }
            }

            self.lock_job_list_lock();
            self.lock_job_list();

            let ready = match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => collect_readiness(&events),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => HashMap::new(),
                Err(e) => {
                    warn!("socket multiplexer poll failed: {e}");
                    HashMap::new()
                }
            };
            if !ready.is_empty() {
                self.run_ready_jobs(&ready);
            }
            self.passes.fetch_add(1, Ordering::Relaxed);

            self.unlock_job_list();
        }
    }

    /// Runs every job whose socket is ready, walking the list with a cursor.
    fn run_ready_jobs(&self, ready: &HashMap<Token, Readiness>) {
        let cursor = lock(&self.state).jobs.new_cursor();
        loop {
            let (index, socket, job, readiness) = {
                let mut state = lock(&self.state);
                let Some(index) = state.jobs.next_cursor(cursor) else {
                    break;
                };
                let Some(socket) = state.jobs.socket(index) else {
                    continue;
                };
                let Some(&readiness) = ready.get(&token_for(socket)) else {
                    continue;
                };
                let Some(job) = state.jobs.job_mut(index).and_then(Option::take) else {
                    continue;
                };
                (index, socket, job, readiness)
            };

            trace!("running job for socket {socket}: {readiness:?}");
            match job.run(readiness) {
                Some(mut next) => {
                    self.arm(socket, next.as_mut());
                    let mut state = lock(&self.state);
                    if let Some(slot) = state.jobs.job_mut(index) {
                        *slot = Some(next);
                    }
                }
                None => {
                    // The job and its socket were dropped by `run`; closing the
                    // descriptor removes it from the poller.
                    let mut state = lock(&self.state);
                    state.jobs.erase(index);
                    state.sockets.remove(&socket);
                }
            }
        }
        lock(&self.state).jobs.delete_cursor(cursor);
    }
}

fn collect_readiness(events: &Events) -> HashMap<Token, Readiness> {
    let mut ready: HashMap<Token, Readiness> = HashMap::new();
    for event in events {
        if event.token() == WAKER_TOKEN {
            continue;
        }
        ready
            .entry(event.token())
            .or_default()
            .merge(Readiness::from_event(event));
    }
    ready
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── SocketMultiplexer ─────────────────────────────────────────────────────────

/// Owns every registered socket and services them on one thread.
pub struct SocketMultiplexer {
    shared: Arc<Shared>,
    thread: Option<WorkerThread>,
}

impl SocketMultiplexer {
    /// Starts the service thread.  A panic in a job logs and exits the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or the thread cannot be created.
    pub fn new() -> Result<Self, SocketError> {
        Self::with_fatal_handler(Arc::new(|reason: &str| {
            error!("socket multiplexer died: {reason}");
            std::process::exit(EXIT_FAILURE);
        }))
    }

    /// Starts the service thread with a custom handler for its death.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or the thread cannot be created.
    pub fn with_fatal_handler(fatal: FatalHandler) -> Result<Self, SocketError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(JobListState::default()),
            jobs_ready_changed: Condvar::new(),
            list_lock_changed: Condvar::new(),
            lock_lock_changed: Condvar::new(),
            registry,
            waker,
            passes: AtomicU64::new(0),
        });

        let service = Arc::clone(&shared);
        let thread = WorkerThread::spawn("socket-multiplexer", move |token| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| service.service(poll, &token)));
            match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!("socket job panicked: {reason}");
                    service.release_held_locks();
                    service.stop();
                    fatal(&reason);
                    Err(Cancelled)
                }
            }
        })?;
        let stopper = Arc::clone(&shared);
        thread.token().on_cancel(move || stopper.stop());
        debug!("socket multiplexer started");

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Registers `job` for `socket`, replacing any job already registered.
    ///
    /// Callable from any thread except the service thread.  The job is
    /// polled from the next pass on.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::MultiplexerStopped`] after the service thread
    /// has died, or the registration error from the poller.
    pub fn add_socket(&self, socket: EventTarget, job: Box<dyn SocketJob>) -> Result<(), SocketError> {
        self.shared.acquire_list();
        let result = self.insert_job(socket, job);
        self.shared.unlock_job_list();
        result
    }

    /// Inserts or replaces the job for `socket`.  The list lock must be held.
    fn insert_job(&self, socket: EventTarget, mut job: Box<dyn SocketJob>) -> Result<(), SocketError> {
        let mut state = lock(&self.shared.state);
        if state.stopped {
            return Err(SocketError::MultiplexerStopped);
        }
        if let Some(interest) = job.interest() {
            self.shared
                .registry
                .register(job.source(), token_for(socket), interest)?;
        }
        match state.sockets.get(&socket).copied() {
            Some(index) => {
                let previous = state.jobs.job_mut(index).and_then(|slot| slot.replace(job));
                if let Some(mut previous) = previous {
                    if let Err(e) = self.shared.registry.deregister(previous.source()) {
                        trace!("deregistering replaced job for socket {socket}: {e}");
                    }
                }
            }
            None => {
                let index = state.jobs.push_back(socket, job);
                state.sockets.insert(socket, index);
            }
        }
        Ok(())
    }

    /// Unregisters and drops the job for `socket`.  No-op if absent.
    ///
    /// Blocks until any in-flight job for the socket has finished.
    pub fn remove_socket(&self, socket: EventTarget) {
        self.shared.acquire_list();
        let removed = {
            let mut state = lock(&self.shared.state);
            let index = state.sockets.remove(&socket);
            index.and_then(|index| state.jobs.erase(index))
        };
        if let Some(Entry::Job { job: Some(mut job), .. }) = removed {
            if let Err(e) = self.shared.registry.deregister(job.source()) {
                trace!("deregistering socket {socket}: {e}");
            }
        }
        self.shared.unlock_job_list();
    }

    /// Returns `true` if a job is registered for `socket`.
    pub fn contains(&self, socket: EventTarget) -> bool {
        lock(&self.shared.state).sockets.contains_key(&socket)
    }

    pub fn socket_count(&self) -> usize {
        lock(&self.shared.state).jobs.len()
    }

    /// Number of completed poll passes.
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    /// Returns `false` once the service thread has died.
    pub fn is_running(&self) -> bool {
        !lock(&self.shared.state).stopped
    }
}

impl Drop for SocketMultiplexer {
    fn drop(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.cancel();
            thread.wait();
        }
        let remaining = lock(&self.shared.state).jobs.len();
        debug!("socket multiplexer stopped with {remaining} sockets registered");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
