//! TCP stream jobs: non-blocking connect plus disconnect detection.
//!
//! The keyboard/mouse protocol is not decoded here; a connected stream is
//! watched only so that the session learns when the peer goes away.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace};

use super::job::{Readiness, SocketJob};
use crate::event::{names, Event, EventQueue, EventTarget, EventType};

/// Payload of a `socket.connection_failed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailed {
    pub addr: SocketAddr,
    pub what: String,
}

/// The event types a [`StreamJob`] emits.
#[derive(Debug, Clone, Copy)]
pub struct StreamEvents {
    pub connected: EventType,
    pub connection_failed: EventType,
    pub disconnected: EventType,
}

impl StreamEvents {
    pub fn register(events: &EventQueue) -> Self {
        Self {
            connected: events.register_type(names::SOCKET_CONNECTED),
            connection_failed: events.register_type(names::SOCKET_CONNECTION_FAILED),
            disconnected: events.register_type(names::SOCKET_DISCONNECTED),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
}

/// Watches one TCP stream on the multiplexer thread.
///
/// Events are addressed to `target`, the identity of the owning connection
/// object.
pub struct StreamJob {
    target: EventTarget,
    peer: SocketAddr,
    stream: TcpStream,
    state: State,
    events: Arc<EventQueue>,
    types: StreamEvents,
    received: u64,
}

impl StreamJob {
    /// Starts a non-blocking connect to `peer`.
    ///
    /// # Errors
    ///
    /// Returns the error if the socket cannot even be created (for example
    /// an unsupported address family).
    pub fn connect(target: EventTarget, peer: SocketAddr, events: Arc<EventQueue>) -> io::Result<Box<Self>> {
        let stream = TcpStream::connect(peer)?;
        let types = StreamEvents::register(&events);
        Ok(Box::new(Self {
            target,
            peer,
            stream,
            state: State::Connecting,
            events,
            types,
            received: 0,
        }))
    }

    /// Watches an already connected stream (for example one accepted by a
    /// listener).
    pub fn connected(target: EventTarget, peer: SocketAddr, stream: TcpStream, events: Arc<EventQueue>) -> Box<Self> {
        let types = StreamEvents::register(&events);
        Box::new(Self {
            target,
            peer,
            stream,
            state: State::Connected,
            events,
            types,
            received: 0,
        })
    }

    fn fail(&self, what: String) {
        debug!("connection to {} failed: {what}", self.peer);
        self.events.add_event(Event::with_data(
            self.types.connection_failed,
            self.target,
            ConnectionFailed { addr: self.peer, what },
        ));
    }

    /// Completes (or fails) a pending connect.
    fn finish_connect(mut self: Box<Self>, ready: Readiness) -> Option<Box<dyn SocketJob>> {
        if let Ok(Some(e)) | Err(e) = self.stream.take_error() {
            self.fail(e.to_string());
            return None;
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                debug!("connected to {}", self.peer);
                self.state = State::Connected;
                self.events.add_event(Event::new(self.types.connected, self.target));
                Some(self)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected && !ready.error => Some(self),
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    /// Drains readable data; returns `false` once the peer has gone away.
    fn drain(&mut self) -> bool {
        let mut buf = [0_u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => self.received += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    trace!("read from {} failed: {e}", self.peer);
                    return false;
                }
            }
        }
    }
}

impl SocketJob for StreamJob {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn interest(&self) -> Option<Interest> {
        match self.state {
            State::Connecting => Some(Interest::WRITABLE),
            State::Connected => Some(Interest::READABLE),
        }
    }

    fn run(mut self: Box<Self>, ready: Readiness) -> Option<Box<dyn SocketJob>> {
        match self.state {
            State::Connecting => self.finish_connect(ready),
            State::Connected => {
                if self.drain() && !ready.error {
                    return Some(self);
                }
                debug!("disconnected from {} after {} bytes", self.peer, self.received);
                self.events.add_event(Event::new(self.types.disconnected, self.target));
                None
            }
        }
    }
}
