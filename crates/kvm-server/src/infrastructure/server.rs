//! The client-facing server.
//!
//! # What it does (for beginners)
//!
//! Once the session is `Started`, every connection the listener accepts is
//! handed to [`Server::adopt_client`].  The server gives the connection an id,
//! asks the socket multiplexer to watch it, and reports what happens with
//! events addressed to [`Server::target`]:
//!
//! | Event                       | Data   | When                              |
//! |-----------------------------|--------|-----------------------------------|
//! | `server.client_connected`   | `Uuid` | a connection was adopted          |
//! | `server.client_disconnected`| `Uuid` | the peer went away                |
//! | `server.disconnected`       | –      | [`Server::disconnect`] dropped all |
//!
//! Dropping all clients is how "force reconnect" works: clients notice the
//! closed connection and reconnect on their own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kvm_core::event::{names, Event, EventQueue, EventTarget, EventType, TimerHandle};
use kvm_core::mt::lock;
use kvm_core::net::{AcceptedConnection, SocketError, SocketMultiplexer, StreamJob};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::storage::config::ServerConfig;

/// A connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
struct ServerEvents {
    client_connected: EventType,
    client_disconnected: EventType,
    disconnected: EventType,
    socket_disconnected: EventType,
}

impl ServerEvents {
    fn register(events: &EventQueue) -> Self {
        Self {
            client_connected: events.register_type(names::SERVER_CLIENT_CONNECTED),
            client_disconnected: events.register_type(names::SERVER_CLIENT_DISCONNECTED),
            disconnected: events.register_type(names::SERVER_DISCONNECTED),
            socket_disconnected: events.register_type(names::SOCKET_DISCONNECTED),
        }
    }
}

pub struct Server {
    target: EventTarget,
    events: Arc<EventQueue>,
    multiplexer: Arc<SocketMultiplexer>,
    config: ServerConfig,
    primary_name: String,
    clients: Arc<Mutex<HashMap<EventTarget, ClientInfo>>>,
    types: ServerEvents,
    heartbeat: Option<TimerHandle>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        primary_name: &str,
        events: Arc<EventQueue>,
        multiplexer: Arc<SocketMultiplexer>,
    ) -> Self {
        let types = ServerEvents::register(&events);
        let mut server = Self {
            target: EventTarget::allocate(),
            events,
            multiplexer,
            config,
            primary_name: primary_name.to_string(),
            clients: Arc::new(Mutex::new(HashMap::new())),
            types,
            heartbeat: None,
        };
        server.arm_heartbeat();
        server
    }

    pub fn target(&self) -> EventTarget {
        self.target
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn primary_name(&self) -> &str {
        &self.primary_name
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        lock(&self.clients).values().cloned().collect()
    }

    /// Takes ownership of an accepted connection.
    ///
    /// # Errors
    ///
    /// [`SocketError::MultiplexerStopped`] if the connection cannot be
    /// watched; the connection is closed.
    pub fn adopt_client(&self, connection: AcceptedConnection) -> Result<Uuid, SocketError> {
        let AcceptedConnection { stream, peer } = connection;
        let id = Uuid::new_v4();
        let target = EventTarget::allocate();
        lock(&self.clients).insert(target, ClientInfo { id, peer });

        // The handler goes in before the job so an immediate hang-up is seen.
        let clients = Arc::clone(&self.clients);
        let weak = Arc::downgrade(&self.events);
        let server = self.target;
        let client_disconnected = self.types.client_disconnected;
        self.events.adopt_handler(self.types.socket_disconnected, target, move |_| {
            let Some(client) = lock(&clients).remove(&target) else {
                return;
            };
            info!("client {} ({}) disconnected", client.id, client.peer);
            if let Some(events) = weak.upgrade() {
                events.remove_handlers(target);
                events.add_event(Event::with_data(client_disconnected, server, client.id));
            }
        });

        let job = StreamJob::connected(target, peer, stream, Arc::clone(&self.events));
        if let Err(e) = self.multiplexer.add_socket(target, job) {
            lock(&self.clients).remove(&target);
            self.events.remove_handlers(target);
            return Err(e);
        }

        info!("client {id} connected from {peer}");
        self.events
            .add_event(Event::with_data(self.types.client_connected, self.target, id));
        Ok(id)
    }

    /// Closes every client connection and raises `server.disconnected`.
    pub fn disconnect(&self) {
        let closed = self.close_all();
        if closed > 0 {
            info!("disconnected {closed} clients");
        }
        self.events.add_event(Event::new(self.types.disconnected, self.target));
    }

    /// Replaces the configuration of a running server.
    ///
    /// Returns `false` (and keeps the old configuration) when the new one
    /// no longer knows the primary screen.
    pub fn set_config(&mut self, config: ServerConfig) -> bool {
        let Some(name) = config.canonical_name(&self.primary_name) else {
            warn!("new configuration has no screen named \"{}\"", self.primary_name);
            return false;
        };
        self.primary_name = name.to_string();
        let heartbeat_changed = config.options.heartbeat_ms != self.config.options.heartbeat_ms;
        self.config = config;
        if heartbeat_changed {
            self.disarm_heartbeat();
            self.arm_heartbeat();
        }
        debug!("server configuration updated");
        true
    }

    fn close_all(&self) -> usize {
        let closed: Vec<(EventTarget, ClientInfo)> = lock(&self.clients).drain().collect();
        for (target, client) in &closed {
            debug!("closing client {}", client.id);
            self.multiplexer.remove_socket(*target);
            self.events.remove_handlers(*target);
        }
        closed.len()
    }

    fn arm_heartbeat(&mut self) {
        let interval = self.config.options.heartbeat_ms;
        if interval == 0 {
            return;
        }
        let timer = self.events.new_timer(Duration::from_millis(interval), None);
        let clients = Arc::clone(&self.clients);
        self.events.adopt_handler(EventType::TIMER, timer.target(), move |event| {
            let late = event.timer_event().map_or(0, |timer| timer.count.saturating_sub(1));
            if late > 0 {
                debug!("heartbeat ran {late} periods late");
            }
            trace!("heartbeat: {} clients", lock(&clients).len());
        });
        self.heartbeat = Some(timer);
    }

    fn disarm_heartbeat(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            self.events.remove_handler(EventType::TIMER, timer.target());
            self.events.delete_timer(timer);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.disarm_heartbeat();
        self.close_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
