//! Stress tests for the socket multiplexer.
//!
//! # Purpose
//!
//! Several threads add and remove sockets while the service thread keeps
//! polling.  The sockets are UDP sockets registered for writability.  A fresh
//! UDP socket is writable at once, so each job runs on the first pass after
//! it is registered; readiness is edge-triggered, so later passes mostly end
//! on the poll timeout.  The tests verify that:
//!
//! - nothing crashes or deadlocks across at least 1,000 poll passes;
//! - a newly added socket is never skipped for more than one pass;
//! - removed sockets are never serviced again and their jobs are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kvm_core::event::EventTarget;
use kvm_core::net::{CallbackJob, JobAction, SocketMultiplexer};
use mio::Interest;

fn udp() -> mio::net::UdpSocket {
    mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
}

fn multiplexer() -> Arc<SocketMultiplexer> {
    Arc::new(SocketMultiplexer::with_fatal_handler(Arc::new(|reason: &str| panic!("multiplexer died: {reason}"))).unwrap())
}

/// Counts live jobs through drop.
struct Live(Arc<AtomicUsize>);

impl Live {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Four threads churn sockets for at least 1,000 passes.  Afterwards every
/// job has been dropped exactly once.
#[test]
fn test_concurrent_add_remove_survives_thousand_passes() {
    // Arrange
    let mux = multiplexer();
    let live = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    // A socket that stays registered for the whole run.
    mux.add_socket(EventTarget::allocate(), CallbackJob::new(udp(), Interest::WRITABLE, |_, _| JobAction::Keep))
        .unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let mux = Arc::clone(&mux);
            let live = Arc::clone(&live);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut mine = Vec::new();
                while !stop.load(Ordering::SeqCst) {
                    let socket = EventTarget::allocate();
                    let guard = Live::new(&live);
                    mux.add_socket(
                        socket,
                        CallbackJob::new(udp(), Interest::WRITABLE, move |_, _| {
                            let _live = &guard;
                            JobAction::Keep
                        }),
                    )
                    .unwrap();
                    mine.push(socket);
                    if mine.len() > 8 {
                        mux.remove_socket(mine.remove(0));
                    }
                }
                for socket in mine {
                    mux.remove_socket(socket);
                }
            })
        })
        .collect();

    // Act
    let started = mux.passes();
    let deadline = Instant::now() + Duration::from_secs(60);
    while mux.passes() < started + 1000 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap();
    }

    // Assert
    assert!(mux.passes() >= started + 1000, "only {} passes", mux.passes() - started);
    assert!(mux.is_running());
    assert_eq!(mux.socket_count(), 1);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

/// A socket added from another thread is serviced by the first pass that
/// starts after `add_socket` returns.
#[test]
fn test_new_socket_is_serviced_on_next_pass() {
    // Arrange
    let mux = multiplexer();
    mux.add_socket(EventTarget::allocate(), CallbackJob::new(udp(), Interest::WRITABLE, |_, _| JobAction::Keep))
        .unwrap();
    let first_run: Arc<Mutex<HashMap<u64, u64>>> = Arc::new(Mutex::new(HashMap::new()));

    for _ in 0..20 {
        let socket = EventTarget::allocate();
        let runs = Arc::clone(&first_run);
        let observer = Arc::clone(&mux);

        // Act
        mux.add_socket(
            socket,
            CallbackJob::new(udp(), Interest::WRITABLE, move |_, _| {
                runs.lock().unwrap().entry(socket.id()).or_insert_with(|| observer.passes());
                JobAction::Remove
            }),
        )
        .unwrap();
        let added_at = mux.passes();

        // Assert
        let deadline = Instant::now() + Duration::from_secs(5);
        let ran_at = loop {
            if let Some(&pass) = first_run.lock().unwrap().get(&socket.id()) {
                break pass;
            }
            assert!(Instant::now() < deadline, "socket never serviced");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(ran_at <= added_at + 1, "added at pass {added_at}, first ran at {ran_at}");
    }
}

/// Once `remove_socket` returns the job never runs again.
#[test]
fn test_removed_socket_is_never_serviced_again() {
    // Arrange
    let mux = multiplexer();
    let sockets: Vec<EventTarget> = (0..16).map(|_| EventTarget::allocate()).collect();
    let removed: Arc<Mutex<Vec<EventTarget>>> = Arc::new(Mutex::new(Vec::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    for &socket in &sockets {
        let removed = Arc::clone(&removed);
        let violations = Arc::clone(&violations);
        mux.add_socket(
            socket,
            CallbackJob::new(udp(), Interest::WRITABLE, move |_, _| {
                if removed.lock().unwrap().contains(&socket) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                JobAction::Keep
            }),
        )
        .unwrap();
    }

    // Act
    for &socket in &sockets {
        mux.remove_socket(socket);
        removed.lock().unwrap().push(socket);
        std::thread::sleep(Duration::from_millis(2));
    }
    std::thread::sleep(Duration::from_millis(50));

    // Assert
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(mux.socket_count(), 0);
}
