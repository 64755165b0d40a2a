//! Client connect/retry state machine.
//!
//! # How reconnecting works (for beginners)
//!
//! ```text
//! Disconnected --start_client----------------------> Connecting
//! Connecting   --connected-------------------------> Connected
//! Connecting   --failed, more addresses------------> Connecting (next address, at once)
//! Connecting   --failed, no more addresses---------> Disconnected (retry timer, or Quit)
//! Connected    --disconnected----------------------> Disconnected (retry timer, or Quit)
//! ```
//!
//! The secondary screen is opened by the first [`ClientSession::start_client`]
//! and kept across reconnects.  A [`Client`] exists only while a connection
//! attempt is outstanding or established; the retry timer exists only while a
//! reconnect is scheduled, and never both at once.
//!
//! A failure whose [`FailInfo::retry`] is `false`, or any failure of a session
//! that is not restartable, raises `Quit`.
//!
//! While the screen is suspended no reconnect is scheduled.  Resuming
//! reconnects if the session was connected (or trying to be) when it was
//! suspended.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use kvm_core::event::{names, Event, EventQueue, EventTarget, EventType, TimerHandle};
use kvm_core::mt::lock;
use kvm_core::net::{NetworkAddress, SocketMultiplexer};
use kvm_core::screen::{Screen, ScreenError, ScreenFactory};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::infrastructure::client::{Client, ClientEvents, ConnectionState, FailInfo};
use crate::infrastructure::resolver::AddressResolver;

/// Wait between reconnect rounds.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long a single connection attempt may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A terminal failure.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to open secondary screen: {0}")]
    Screen(#[from] ScreenError),
}

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// This computer's screen name.
    pub name: String,
    pub server: NetworkAddress,
    /// Retry failures instead of quitting.
    pub restartable: bool,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(name: impl Into<String>, server: NetworkAddress) -> Self {
        Self {
            name: name.into(),
            server,
            restartable: true,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

type Action = fn(&mut ClientSession, &Event);

pub struct ClientSession {
    this: Weak<Mutex<ClientSession>>,
    events: Arc<EventQueue>,
    multiplexer: Arc<SocketMultiplexer>,
    screens: Box<dyn ScreenFactory>,
    resolver: Arc<dyn AddressResolver>,
    options: ClientOptions,
    types: ClientEvents,
    screen: Option<Box<dyn Screen>>,
    client: Option<Client>,
    retry_timer: Option<TimerHandle>,
    last_address_index: usize,
    attempts: usize,
    suspended: bool,
    connect_on_resume: bool,
    failed: bool,
}

impl ClientSession {
    pub fn new(
        events: Arc<EventQueue>,
        multiplexer: Arc<SocketMultiplexer>,
        screens: Box<dyn ScreenFactory>,
        resolver: Arc<dyn AddressResolver>,
        options: ClientOptions,
    ) -> Arc<Mutex<Self>> {
        let types = ClientEvents::register(&events);
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                this: this.clone(),
                events,
                multiplexer,
                screens,
                resolver,
                options,
                types,
                screen: None,
                client: None,
                retry_timer: None,
                last_address_index: 0,
                attempts: 0,
                suspended: false,
                connect_on_resume: false,
                failed: false,
            })
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.client.as_ref().map_or(ConnectionState::Disconnected, Client::state)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    pub fn screen_target(&self) -> Option<EventTarget> {
        self.screen.as_ref().map(|screen| screen.event_target())
    }

    /// Connection attempts made so far, one per address tried.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Index of the resolved address the next attempt will use.
    pub fn last_address_index(&self) -> usize {
        self.last_address_index
    }

    pub fn is_retry_pending(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// `true` once the session has given up and raised `Quit`.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Opens the screen if needed, then starts a connection attempt.
    ///
    /// An unavailable screen on a restartable session schedules another try
    /// and returns `Ok`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Screen`] if the screen cannot be opened.
    pub fn start_client(&mut self) -> Result<(), ClientError> {
        if self.screen.is_none() {
            match self.open_client_screen() {
                Ok(screen) => {
                    self.screen = Some(screen);
                    info!("started client \"{}\"", self.options.name);
                }
                Err(ScreenError::Unavailable { reason, retry_after }) if self.options.restartable => {
                    warn!("secondary screen unavailable: {reason}");
                    self.schedule_restart(retry_after);
                    return Ok(());
                }
                Err(e) => {
                    error!("failed to start client: {e}");
                    return Err(e.into());
                }
            }
        }

        if self.suspended {
            self.connect_on_resume = true;
            return Ok(());
        }
        if self.client.is_none() {
            self.client = Some(self.open_client());
        }
        self.connect();
        Ok(())
    }

    /// Drops the connection and any scheduled reconnect.  The screen stays
    /// open.
    pub fn stop_client(&mut self) {
        self.stop_retry_timer();
        self.close_client();
        self.connect_on_resume = false;
    }

    /// Stops the client and closes the screen.
    pub fn cleanup_client(&mut self) {
        self.stop_client();
        self.close_client_screen();
    }

    pub fn suspend(&mut self) {
        if !self.suspended {
            info!("suspend");
            let was_active = self.client.is_some() || self.retry_timer.is_some();
            self.stop_client();
            self.suspended = true;
            self.connect_on_resume = was_active;
        }
    }

    /// # Errors
    ///
    /// Terminal failures of the reconnect.
    pub fn resume(&mut self) -> Result<(), ClientError> {
        if !self.suspended {
            return Ok(());
        }
        info!("resume");
        self.suspended = false;
        if std::mem::take(&mut self.connect_on_resume) {
            self.start_client()?;
        }
        Ok(())
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Wraps `action` as a queue handler that locks this session.
    fn bind(&self, action: Action) -> impl Fn(&Event) + Send + Sync + 'static {
        let this = self.this.clone();
        move |event| {
            if let Some(session) = this.upgrade() {
                action(&mut lock(&session), event);
            }
        }
    }

    fn client_actions(&self) -> [(EventType, Action); 4] {
        [
            (self.types.connected, Self::handle_client_connected as Action),
            (self.types.connection_failed, Self::handle_client_failed as Action),
            (self.types.connection_refused, Self::handle_client_refused as Action),
            (self.types.disconnected, Self::handle_client_disconnected as Action),
        ]
    }

    fn screen_actions(&self) -> [(EventType, Action); 3] {
        [
            (self.events.register_type(names::SCREEN_ERROR), Self::handle_screen_error as Action),
            (self.events.register_type(names::SCREEN_SUSPEND), Self::handle_suspend as Action),
            (self.events.register_type(names::SCREEN_RESUME), Self::handle_resume as Action),
        ]
    }

    fn handle_client_connected(&mut self, _: &Event) {
        info!("connected to server");
        if let Some(screen) = self.screen.as_mut() {
            screen.enable();
        }
    }

    fn handle_client_failed(&mut self, event: &Event) {
        let info = fail_info(event);
        self.last_address_index += 1;
        let resolved = self.client.as_ref().map_or(0, Client::resolved_address_count);
        if self.last_address_index < resolved {
            warn!("failed to connect to server: {}, trying next address", info.what);
            if self.suspended {
                self.connect_on_resume = true;
            } else {
                self.connect();
            }
        } else {
            self.last_address_index = 0;
            self.refused(&info);
        }
    }

    fn handle_client_refused(&mut self, event: &Event) {
        self.refused(&fail_info(event));
    }

    fn refused(&mut self, info: &FailInfo) {
        self.close_client();
        if !self.options.restartable || !info.retry {
            error!("failed to connect to server: {}", info.what);
            self.fail();
        } else {
            warn!("failed to connect to server: {}", info.what);
            if !self.suspended {
                self.schedule_restart(self.options.retry_delay);
            }
        }
    }

    fn handle_client_disconnected(&mut self, _: &Event) {
        info!("disconnected from server");
        self.close_client();
        if let Some(screen) = self.screen.as_mut() {
            screen.disable();
        }
        if !self.options.restartable {
            self.fail();
        } else if !self.suspended {
            self.schedule_restart(self.options.retry_delay);
        }
    }

    fn handle_restart(&mut self, _: &Event) {
        self.stop_retry_timer();
        if self.start_client().is_err() {
            self.fail();
        }
    }

    fn handle_screen_error(&mut self, _: &Event) {
        error!("error on screen");
        self.fail();
    }

    fn handle_suspend(&mut self, _: &Event) {
        self.suspend();
    }

    fn handle_resume(&mut self, _: &Event) {
        if self.resume().is_err() {
            self.fail();
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn open_client_screen(&mut self) -> Result<Box<dyn Screen>, ScreenError> {
        let screen = self.screens.open(&self.events)?;
        let target = screen.event_target();
        for (kind, action) in self.screen_actions() {
            self.events.adopt_handler(kind, target, self.bind(action));
        }
        Ok(screen)
    }

    fn close_client_screen(&mut self) {
        if let Some(mut screen) = self.screen.take() {
            let target = screen.event_target();
            for (kind, _) in self.screen_actions() {
                self.events.remove_handler(kind, target);
            }
            screen.disable();
        }
    }

    fn open_client(&self) -> Client {
        let client = Client::new(
            self.options.server.clone(),
            Arc::clone(&self.resolver),
            self.options.connect_timeout,
            Arc::clone(&self.events),
            Arc::clone(&self.multiplexer),
        );
        for (kind, action) in self.client_actions() {
            self.events.adopt_handler(kind, client.target(), self.bind(action));
        }
        client
    }

    fn close_client(&mut self) {
        if let Some(client) = self.client.take() {
            for (kind, _) in self.client_actions() {
                self.events.remove_handler(kind, client.target());
            }
        }
    }

    fn connect(&mut self) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        if client.state() != ConnectionState::Disconnected {
            return;
        }
        self.attempts += 1;
        debug!("connection attempt {} (address {})", self.attempts, self.last_address_index);
        client.connect(self.last_address_index);
    }

    fn schedule_restart(&mut self, after: Duration) {
        self.stop_retry_timer();
        debug_assert!(self.client.is_none(), "reconnect scheduled with a live client");
        let after = after.max(Duration::from_millis(1));
        debug!("retry in {:.0} seconds", after.as_secs_f64());
        let timer = self.events.new_one_shot_timer(after, None);
        self.events
            .adopt_handler(EventType::TIMER, timer.target(), self.bind(Self::handle_restart));
        self.retry_timer = Some(timer);
    }

    fn stop_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            self.events.remove_handler(EventType::TIMER, timer.target());
            self.events.delete_timer(timer);
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.events.quit();
    }
}

fn fail_info(event: &Event) -> FailInfo {
    event.data::<FailInfo>().cloned().unwrap_or_else(|| FailInfo {
        what: "unknown error".to_string(),
        retry: true,
    })
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cleanup_client();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::resolver::{MockAddressResolver, StaticResolver};
    use kvm_core::net::SocketError;
    use kvm_core::screen::mock::ScriptedScreenFactory;
    use kvm_core::screen::HeadlessScreenFactory;
    use mockall::mock;
    use std::net::SocketAddr;
    use std::time::Instant;

    mock! {
        Screens {}
        impl ScreenFactory for Screens {
            fn open(&mut self, events: &Arc<EventQueue>) -> Result<Box<dyn Screen>, ScreenError>;
        }
    }

    fn multiplexer() -> Arc<SocketMultiplexer> {
        Arc::new(SocketMultiplexer::with_fatal_handler(Arc::new(|_: &str| {})).expect("multiplexer"))
    }

    fn refusing_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn options(restartable: bool) -> ClientOptions {
        let mut options = ClientOptions::new("laptop", NetworkAddress::new("server", 24800));
        options.restartable = restartable;
        options.retry_delay = Duration::from_millis(20);
        options
    }

    fn session_with(
        events: &Arc<EventQueue>,
        screens: Box<dyn ScreenFactory>,
        resolver: Arc<dyn AddressResolver>,
        restartable: bool,
    ) -> Arc<Mutex<ClientSession>> {
        ClientSession::new(Arc::clone(events), multiplexer(), screens, resolver, options(restartable))
    }

    /// Dispatches events until `done` holds.  Returns `true` if a `Quit`
    /// arrived first.
    fn pump(events: &EventQueue, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            if let Some(event) = events.get_event(Some(Duration::from_millis(20))) {
                if event.is_quit() {
                    return true;
                }
                events.dispatch_event(event);
            }
        }
        false
    }

    // ── Connect / retry ───────────────────────────────────────────────────────

    #[test]
    fn test_start_client_connects_to_resolved_address() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![addr])),
            false,
        );

        // Act
        lock(&session).start_client().expect("start");
        let quit = pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));

        // Assert
        let session = lock(&session);
        assert!(!quit);
        assert_eq!(session.attempts(), 1);
        assert!(session.screen_target().is_some());
        assert!(!session.is_retry_pending());
    }

    #[test]
    fn test_failed_address_moves_to_next_without_waiting() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let good = listener.local_addr().unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![refusing_addr(), good])),
            true,
        );

        // Act
        lock(&session).start_client().expect("start");
        let quit = pump(&events, || lock(&session).state() == ConnectionState::Connected(good));

        // Assert
        let session = lock(&session);
        assert!(!quit);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.last_address_index(), 1);
        assert!(!session.is_retry_pending());
    }

    #[test]
    fn test_exhausted_addresses_schedule_retry_when_restartable() {
        // Arrange
        let events = EventQueue::new();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![refusing_addr(), refusing_addr()])),
            true,
        );

        // Act
        lock(&session).start_client().expect("start");
        let quit = pump(&events, || lock(&session).is_retry_pending());

        // Assert
        let session = lock(&session);
        assert!(!quit);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.last_address_index(), 0);
        assert!(session.client().is_none());
        assert!(!session.has_failed());
    }

    #[test]
    fn test_resolution_failure_without_restart_quits() {
        // Arrange
        let events = EventQueue::new();
        let mut resolver = MockAddressResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|address| Err(SocketError::NoAddress { host: address.host().to_string() }));
        let session = session_with(&events, Box::new(HeadlessScreenFactory), Arc::new(resolver), false);

        // Act
        lock(&session).start_client().expect("start");
        let quit = pump(&events, || false);

        // Assert
        assert!(quit);
        assert!(lock(&session).has_failed());
        assert!(lock(&session).client().is_none());
    }

    #[test]
    fn test_refusal_without_retry_quits_even_when_restartable() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![listener.local_addr().unwrap()])),
            true,
        );
        lock(&session).start_client().expect("start");
        let target = lock(&session).client().map(Client::target).expect("client");

        // Act
        let refused = events.register_type(names::CLIENT_CONNECTION_REFUSED);
        events.add_event(Event::with_data(
            refused,
            target,
            FailInfo {
                what: "incompatible server".to_string(),
                retry: false,
            },
        ));
        let quit = pump(&events, || false);

        // Assert
        assert!(quit);
        assert!(lock(&session).has_failed());
        assert!(!lock(&session).is_retry_pending());
    }

    #[test]
    fn test_disconnect_reconnects_when_restartable() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![addr])),
            true,
        );
        lock(&session).start_client().expect("start");
        pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));
        let (first, _) = listener.accept().unwrap();

        // Act
        drop(first);
        let quit = pump(&events, || lock(&session).is_retry_pending());
        let quit = quit || pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));

        // Assert
        assert!(!quit);
        assert_eq!(lock(&session).attempts(), 2);
    }

    #[test]
    fn test_disconnect_without_restart_quits() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![addr])),
            false,
        );
        lock(&session).start_client().expect("start");
        pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));
        let (peer, _) = listener.accept().unwrap();

        // Act
        drop(peer);
        let quit = pump(&events, || false);

        // Assert
        assert!(quit);
        assert!(lock(&session).has_failed());
    }

    // ── Screen ────────────────────────────────────────────────────────────────

    #[test]
    fn test_unavailable_screen_retries_then_opens_once() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut screens = MockScreens::new();
        let mut calls = 0;
        screens.expect_open().times(2).returning(move |events| {
            calls += 1;
            if calls == 1 {
                Err(ScreenError::Unavailable {
                    reason: "display locked".to_string(),
                    retry_after: Duration::from_millis(10),
                })
            } else {
                HeadlessScreenFactory.open(events)
            }
        });
        let session = session_with(&events, Box::new(screens), Arc::new(StaticResolver::new(vec![addr])), true);

        // Act
        lock(&session).start_client().expect("recoverable failure");
        let waiting = lock(&session).is_retry_pending();
        let quit = pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));

        // Assert
        assert!(waiting);
        assert!(!quit);
        assert!(lock(&session).screen_target().is_some());
    }

    #[test]
    fn test_screen_kept_across_reconnects() {
        // Arrange
        let events = EventQueue::new();
        let screens = ScriptedScreenFactory::new();
        let session = session_with(
            &events,
            Box::new(screens.clone()),
            Arc::new(StaticResolver::new(vec![refusing_addr()])),
            true,
        );

        // Act
        lock(&session).start_client().expect("start");
        pump(&events, || lock(&session).attempts() >= 3);

        // Assert
        assert_eq!(screens.attempts(), 1);
        assert_eq!(screens.opened().len(), 1);
    }

    #[test]
    fn test_screen_open_failure_is_terminal() {
        // Arrange
        let events = EventQueue::new();
        let screens = ScriptedScreenFactory::new();
        screens.fail_next(ScreenError::OpenFailure("no display".to_string()));
        let session = session_with(
            &events,
            Box::new(screens),
            Arc::new(StaticResolver::new(vec![refusing_addr()])),
            true,
        );

        // Act
        let result = lock(&session).start_client();

        // Assert
        assert!(matches!(result, Err(ClientError::Screen(ScreenError::OpenFailure(_)))));
        assert!(lock(&session).client().is_none());
        assert!(!lock(&session).is_retry_pending());
    }

    #[test]
    fn test_suspend_drops_connection_and_resume_reconnects() {
        // Arrange
        let events = EventQueue::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![addr])),
            true,
        );
        lock(&session).start_client().expect("start");
        pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));
        let screen = lock(&session).screen_target().expect("screen");

        // Act
        events.add_event(Event::new(events.register_type(names::SCREEN_SUSPEND), screen));
        pump(&events, || lock(&session).is_suspended());
        let suspended_state = lock(&session).state();
        let retry_while_suspended = lock(&session).is_retry_pending();
        events.add_event(Event::new(events.register_type(names::SCREEN_RESUME), screen));
        let quit = pump(&events, || lock(&session).state() == ConnectionState::Connected(addr));

        // Assert
        assert_eq!(suspended_state, ConnectionState::Disconnected);
        assert!(!retry_while_suspended);
        assert!(!quit);
        assert_eq!(lock(&session).attempts(), 2);
    }

    #[test]
    fn test_screen_error_raises_quit() {
        // Arrange
        let events = EventQueue::new();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![refusing_addr()])),
            true,
        );
        lock(&session).start_client().expect("start");
        let screen = lock(&session).screen_target().expect("screen");

        // Act
        events.add_event(Event::new(events.register_type(names::SCREEN_ERROR), screen));
        let quit = pump(&events, || false);

        // Assert
        assert!(quit);
        assert!(lock(&session).has_failed());
    }

    #[test]
    fn test_cleanup_releases_screen_client_and_timer() {
        // Arrange
        let events = EventQueue::new();
        let session = session_with(
            &events,
            Box::new(HeadlessScreenFactory),
            Arc::new(StaticResolver::new(vec![refusing_addr()])),
            true,
        );
        lock(&session).start_client().expect("start");
        pump(&events, || lock(&session).is_retry_pending());

        // Act
        lock(&session).cleanup_client();

        // Assert
        let session = lock(&session);
        assert!(session.client().is_none());
        assert!(session.screen_target().is_none());
        assert!(!session.is_retry_pending());
        assert_eq!(events.timer_count(), 0);
    }
}
