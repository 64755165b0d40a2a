//! End-to-end tests of the server session lifecycle.
//!
//! # Purpose
//!
//! These tests drive a real [`ServerSession`] with a real event queue,
//! socket multiplexer and loopback sockets, the way the binary does.  They
//! verify that:
//!
//! - a restartable server whose port is taken waits in `Starting` and starts
//!   once the port frees, logging the conflict exactly once;
//! - a screen that cannot be opened is a terminal failure that leaves
//!   nothing behind after cleanup;
//! - control channel commands reach the session and `shutdown` ends the
//!   event loop.

use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kvm_core::ipc::{ControlChannel, ControlOptions};
use kvm_core::mt::lock;
use kvm_core::net::SocketMultiplexer;
use kvm_core::screen::mock::ScriptedScreenFactory;
use kvm_core::screen::{HeadlessScreenFactory, ScreenError, ScreenFactory};
use kvm_core::EventQueue;
use kvm_server::application::server_session::{ServerSession, ServerState, SessionOptions};
use kvm_server::infrastructure::storage::config::ServerConfig;

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// Collects formatted log output.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

fn loopback_config(port: u16) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.address = "127.0.0.1".to_string();
    config.network.port = port;
    config.options.heartbeat_ms = 0;
    config.add_screen("desk");
    config
}

fn session(
    events: &Arc<EventQueue>,
    screens: Box<dyn ScreenFactory>,
    config: ServerConfig,
    backoff: Duration,
) -> Arc<Mutex<ServerSession>> {
    let mut options = SessionOptions::new("desk", &config);
    options.restartable = true;
    options.address_in_use_backoff = backoff;
    let multiplexer = Arc::new(SocketMultiplexer::with_fatal_handler(Arc::new(|_: &str| {})).expect("multiplexer"));
    ServerSession::new(Arc::clone(events), multiplexer, screens, config, options)
}

/// Dispatches events until the session reaches `state`.
fn run_until(events: &EventQueue, session: &Mutex<ServerSession>, state: ServerState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while lock(session).state() != state {
        assert!(Instant::now() < deadline, "session stuck in {}", lock(session).state());
        if let Some(event) = events.get_event(Some(Duration::from_millis(20))) {
            assert!(!event.is_quit(), "unexpected quit");
            events.dispatch_event(event);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_server_on_busy_port_starts_once_port_frees() {
    // Arrange
    let logs = Capture::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let blocker = std::net::TcpListener::bind("127.0.0.1:0").expect("blocker");
    let port = blocker.local_addr().expect("addr").port();
    let events = EventQueue::new();
    let session = session(
        &events,
        Box::new(HeadlessScreenFactory),
        loopback_config(port),
        Duration::from_millis(200),
    );

    // Act
    lock(&session).start_server().expect("recoverable failure");
    let waiting = lock(&session).state();
    drop(blocker);
    run_until(&events, &session, ServerState::Started);

    // Assert
    assert_eq!(waiting, ServerState::Starting);
    assert_eq!(
        lock(&session).state_history(),
        &[
            ServerState::Uninitialized,
            ServerState::Initialized,
            ServerState::Starting,
            ServerState::Started
        ]
    );
    assert_eq!(lock(&session).listen_address().map(|addr| addr.port()), Some(port));
    let text = logs.text();
    assert_eq!(
        text.matches("address already in use").count(),
        1,
        "log output:\n{text}"
    );
}

#[test]
fn test_screen_open_failure_leaves_session_uninitialized() {
    // Arrange
    let events = EventQueue::new();
    let screens = ScriptedScreenFactory::new();
    screens.fail_next(ScreenError::OpenFailure("no display".to_string()));
    let session = session(&events, Box::new(screens.clone()), loopback_config(0), Duration::from_millis(200));

    // Act
    let result = lock(&session).start_server();
    lock(&session).cleanup_server();

    // Assert
    let session = lock(&session);
    assert!(result.is_err());
    assert_eq!(session.state(), ServerState::Uninitialized);
    assert!(session.primary_client().is_none());
    assert!(session.listen_address().is_none());
    assert!(session.server().is_none());
    assert_eq!(screens.attempts(), 1);
    assert!(screens.opened().is_empty());
}

#[test]
fn test_control_channel_commands_reach_the_session() {
    // Arrange
    let events = EventQueue::new();
    let session = session(&events, Box::new(HeadlessScreenFactory), loopback_config(0), Duration::from_millis(200));
    lock(&session).start_server().expect("start");
    let control = ControlChannel::spawn(
        Arc::clone(&events),
        ControlOptions {
            listen: Some("127.0.0.1:0".parse().unwrap()),
            handle_signals: false,
        },
    )
    .expect("control channel");
    let addr = control.local_addr().expect("endpoint");

    let operator = std::thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).expect("connect");
        stream
            .write_all(b"{\"command\":\"reset_server\"}\n{\"command\":\"shutdown\"}\n")
            .expect("write");
        let mut replies = BufReader::new(stream);
        let mut lines = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            replies.read_line(&mut line).expect("reply");
            lines.push(line);
        }
        lines
    });

    // Act
    let started = Instant::now();
    events.run_loop();
    let replies = operator.join().expect("operator thread");

    // Assert
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(replies.iter().all(|line| line.contains("\"ok\":true")), "{replies:?}");
    let history = lock(&session).state_history().to_vec();
    assert_eq!(
        &history[history.len() - 3..],
        &[ServerState::Uninitialized, ServerState::Initialized, ServerState::Started]
    );
    lock(&session).cleanup_server();
    assert_eq!(lock(&session).state(), ServerState::Uninitialized);
}
