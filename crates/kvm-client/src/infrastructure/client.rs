//! The connection to the server.
//!
//! # What it does (for beginners)
//!
//! A [`Client`] makes one connection attempt at a time.  [`Client::connect`]
//! resolves the server address (again, every time), picks one of the
//! resolved addresses and starts a non-blocking connect on the socket
//! multiplexer.  A one-shot timer bounds how long the attempt may take.
//!
//! The outcome is reported with events addressed to [`Client::target`]:
//!
//! | Event                       | Data       | When                              |
//! |-----------------------------|------------|-----------------------------------|
//! | `client.connected`          | –          | the TCP connection is established |
//! | `client.connection_failed`  | `FailInfo` | resolve, connect or timeout failed |
//! | `client.connection_refused` | `FailInfo` | the address can never be used     |
//! | `client.disconnected`       | –          | an established connection closed  |
//!
//! The client never retries by itself; deciding what to do next is the
//! session's job.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use kvm_core::event::{names, Event, EventQueue, EventTarget, EventType, TimerHandle};
use kvm_core::mt::lock;
use kvm_core::net::{ConnectionFailed, NetworkAddress, SocketMultiplexer, StreamEvents, StreamJob};
use tracing::{debug, info};

use super::resolver::AddressResolver;

/// Why a connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailInfo {
    pub what: String,
    /// `false` when trying again cannot help.
    pub retry: bool,
}

/// The event types a [`Client`] emits.
#[derive(Debug, Clone, Copy)]
pub struct ClientEvents {
    pub connected: EventType,
    pub connection_failed: EventType,
    pub connection_refused: EventType,
    pub disconnected: EventType,
}

impl ClientEvents {
    pub fn register(events: &EventQueue) -> Self {
        Self {
            connected: events.register_type(names::CLIENT_CONNECTED),
            connection_failed: events.register_type(names::CLIENT_CONNECTION_FAILED),
            connection_refused: events.register_type(names::CLIENT_CONNECTION_REFUSED),
            disconnected: events.register_type(names::CLIENT_DISCONNECTED),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(SocketAddr),
    Connected(SocketAddr),
}

type Action = fn(&mut Connection, &Event);

pub struct Client {
    target: EventTarget,
    connection: Arc<Mutex<Connection>>,
}

/// State shared with the socket and timer handlers.
struct Connection {
    this: Weak<Mutex<Connection>>,
    target: EventTarget,
    server: NetworkAddress,
    events: Arc<EventQueue>,
    multiplexer: Arc<SocketMultiplexer>,
    resolver: Arc<dyn AddressResolver>,
    connect_timeout: Duration,
    types: ClientEvents,
    stream_types: StreamEvents,
    resolved: usize,
    socket: Option<EventTarget>,
    timer: Option<TimerHandle>,
    state: ConnectionState,
}

impl Client {
    pub fn new(
        server: NetworkAddress,
        resolver: Arc<dyn AddressResolver>,
        connect_timeout: Duration,
        events: Arc<EventQueue>,
        multiplexer: Arc<SocketMultiplexer>,
    ) -> Self {
        let target = EventTarget::allocate();
        let types = ClientEvents::register(&events);
        let stream_types = StreamEvents::register(&events);
        let connection = Arc::new_cyclic(|this| {
            Mutex::new(Connection {
                this: this.clone(),
                target,
                server,
                events,
                multiplexer,
                resolver,
                connect_timeout,
                types,
                stream_types,
                resolved: 0,
                socket: None,
                timer: None,
                state: ConnectionState::Disconnected,
            })
        });
        Self { target, connection }
    }

    /// Identity the client's events are addressed to.
    pub fn target(&self) -> EventTarget {
        self.target
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.connection).state
    }

    /// Number of addresses the last resolution produced (zero if it failed).
    pub fn resolved_address_count(&self) -> usize {
        lock(&self.connection).resolved
    }

    /// Starts connecting to the `index`th resolved address, or the first
    /// one when `index` is out of range.  No-op unless disconnected.
    pub fn connect(&self, index: usize) {
        lock(&self.connection).connect(index);
    }

    /// Drops the connection without raising any event.
    pub fn disconnect(&self) {
        let mut connection = lock(&self.connection);
        if connection.state != ConnectionState::Disconnected {
            debug!("disconnecting from {}", connection.server);
            connection.close();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        lock(&self.connection).close();
    }
}

impl Connection {
    fn connect(&mut self, index: usize) {
        if self.state != ConnectionState::Disconnected {
            return;
        }

        let addrs = match self.resolver.resolve(&self.server) {
            Ok(addrs) => addrs,
            Err(e) => {
                self.resolved = 0;
                self.fail(e.to_string());
                return;
            }
        };
        self.resolved = addrs.len();
        let Some(addr) = addrs.get(index).or_else(|| addrs.first()).copied() else {
            self.fail(format!("no addresses found for {}", self.server.host()));
            return;
        };
        info!("connecting to '{}': {addr}", self.server.host());

        let socket = EventTarget::allocate();
        let job = match StreamJob::connect(socket, addr, Arc::clone(&self.events)) {
            Ok(job) => job,
            Err(e) if matches!(e.kind(), io::ErrorKind::Unsupported | io::ErrorKind::InvalidInput) => {
                self.refuse(format!("{addr}: {e}"));
                return;
            }
            Err(e) => {
                self.fail(format!("{addr}: {e}"));
                return;
            }
        };

        for (kind, action) in self.stream_actions() {
            self.events.adopt_handler(kind, socket, self.bind(action));
        }
        if let Err(e) = self.multiplexer.add_socket(socket, job) {
            self.events.remove_handlers(socket);
            self.fail(e.to_string());
            return;
        }
        self.socket = Some(socket);
        self.state = ConnectionState::Connecting(addr);

        let timer = self.events.new_one_shot_timer(self.connect_timeout, None);
        self.events
            .adopt_handler(EventType::TIMER, timer.target(), self.bind(Self::handle_timeout));
        self.timer = Some(timer);
    }

    /// Closes the socket and the timer.  Raises nothing.
    fn close(&mut self) {
        self.stop_timer();
        if let Some(socket) = self.socket.take() {
            self.events.remove_handlers(socket);
            self.multiplexer.remove_socket(socket);
        }
        self.state = ConnectionState::Disconnected;
    }

    fn fail(&self, what: String) {
        debug!("connection failed: {what}");
        self.send_failure(self.types.connection_failed, FailInfo { what, retry: true });
    }

    fn refuse(&self, what: String) {
        debug!("connection refused: {what}");
        self.send_failure(self.types.connection_refused, FailInfo { what, retry: false });
    }

    fn send_failure(&self, kind: EventType, info: FailInfo) {
        self.events.add_event(Event::with_data(kind, self.target, info));
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn bind(&self, action: Action) -> impl Fn(&Event) + Send + Sync + 'static {
        let this = self.this.clone();
        move |event| {
            if let Some(connection) = this.upgrade() {
                action(&mut lock(&connection), event);
            }
        }
    }

    fn stream_actions(&self) -> [(EventType, Action); 3] {
        [
            (self.stream_types.connected, Self::handle_connected as Action),
            (self.stream_types.connection_failed, Self::handle_connection_failed as Action),
            (self.stream_types.disconnected, Self::handle_disconnected as Action),
        ]
    }

    fn handle_connected(&mut self, _: &Event) {
        let ConnectionState::Connecting(addr) = self.state else {
            return;
        };
        self.stop_timer();
        self.state = ConnectionState::Connected(addr);
        info!("connected to {addr}");
        self.events.add_event(Event::new(self.types.connected, self.target));
    }

    fn handle_connection_failed(&mut self, event: &Event) {
        let what = event.data::<ConnectionFailed>().map_or_else(
            || "connection failed".to_string(),
            |failed| format!("{}: {}", failed.addr, failed.what),
        );
        self.close();
        self.fail(what);
    }

    fn handle_disconnected(&mut self, _: &Event) {
        let was_connected = matches!(self.state, ConnectionState::Connected(_));
        self.close();
        if was_connected {
            self.events.add_event(Event::new(self.types.disconnected, self.target));
        } else {
            self.fail("connection closed while connecting".to_string());
        }
    }

    fn handle_timeout(&mut self, _: &Event) {
        if let ConnectionState::Connecting(addr) = self.state {
            self.close();
            self.fail(format!("{addr}: connection timed out"));
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.events.remove_handler(EventType::TIMER, timer.target());
            self.events.delete_timer(timer);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::resolver::{MockAddressResolver, StaticResolver};
    use kvm_core::net::SocketError;

    fn multiplexer() -> Arc<SocketMultiplexer> {
        Arc::new(SocketMultiplexer::with_fatal_handler(Arc::new(|_: &str| {})).expect("multiplexer"))
    }

    /// A loopback address nothing listens on.
    fn refusing_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn client(events: &Arc<EventQueue>, mux: &Arc<SocketMultiplexer>, addrs: Vec<SocketAddr>) -> Client {
        Client::new(
            NetworkAddress::new("server", 24800),
            Arc::new(StaticResolver::new(addrs)),
            Duration::from_secs(5),
            Arc::clone(events),
            Arc::clone(mux),
        )
    }

    /// Dispatches events until one of `kind` arrives, and returns it.
    fn pump_until(events: &EventQueue, kind: EventType) -> Event {
        loop {
            let event = events
                .get_event(Some(Duration::from_secs(5)))
                .expect("event before timeout");
            if event.kind() == kind {
                return event;
            }
            events.dispatch_event(event);
        }
    }

    #[test]
    fn test_connect_reports_connected_then_disconnected() {
        // Arrange
        let events = EventQueue::new();
        let mux = multiplexer();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = client(&events, &mux, vec![addr]);
        let types = ClientEvents::register(&events);

        // Act
        client.connect(0);
        let connected = pump_until(&events, types.connected);
        let state = client.state();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
        let disconnected = pump_until(&events, types.disconnected);

        // Assert
        assert_eq!(connected.target(), client.target());
        assert_eq!(state, ConnectionState::Connected(addr));
        assert_eq!(disconnected.target(), client.target());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(mux.socket_count(), 0);
        assert_eq!(events.timer_count(), 0);
    }

    #[test]
    fn test_refused_connect_reports_retryable_failure() {
        // Arrange
        let events = EventQueue::new();
        let mux = multiplexer();
        let addr = refusing_addr();
        let client = client(&events, &mux, vec![addr]);
        let types = ClientEvents::register(&events);

        // Act
        client.connect(0);
        let event = pump_until(&events, types.connection_failed);

        // Assert
        let info = event.data::<FailInfo>().expect("fail info");
        assert!(info.retry);
        assert!(info.what.contains(&addr.to_string()), "{}", info.what);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.resolved_address_count(), 1);
        assert_eq!(events.timer_count(), 0);
    }

    #[test]
    fn test_connect_uses_requested_address_index() {
        // Arrange
        let events = EventQueue::new();
        let mux = multiplexer();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = client(&events, &mux, vec![refusing_addr(), addr]);

        // Act
        client.connect(1);
        pump_until(&events, ClientEvents::register(&events).connected);

        // Assert
        assert_eq!(client.state(), ConnectionState::Connected(addr));
        assert_eq!(client.resolved_address_count(), 2);
    }

    #[test]
    fn test_resolution_failure_reports_failure_without_socket() {
        // Arrange
        let events = EventQueue::new();
        let mux = multiplexer();
        let mut resolver = MockAddressResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|address| Err(SocketError::NoAddress { host: address.host().to_string() }));
        let client = Client::new(
            NetworkAddress::new("nowhere.invalid", 24800),
            Arc::new(resolver),
            Duration::from_secs(5),
            Arc::clone(&events),
            Arc::clone(&mux),
        );

        // Act
        client.connect(0);
        let event = pump_until(&events, ClientEvents::register(&events).connection_failed);

        // Assert
        let info = event.data::<FailInfo>().expect("fail info");
        assert!(info.what.contains("nowhere.invalid"));
        assert_eq!(client.resolved_address_count(), 0);
        assert_eq!(mux.socket_count(), 0);
    }

    #[test]
    fn test_disconnect_is_silent_and_releases_everything() {
        // Arrange
        let events = EventQueue::new();
        let mux = multiplexer();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client(&events, &mux, vec![listener.local_addr().unwrap()]);
        let types = ClientEvents::register(&events);
        client.connect(0);
        pump_until(&events, types.connected);

        // Act
        client.disconnect();

        // Assert
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(mux.socket_count(), 0);
        while let Some(event) = events.get_event(Some(Duration::from_millis(50))) {
            assert_ne!(event.kind(), types.disconnected);
        }
    }
}
