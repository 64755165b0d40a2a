//! Listening socket that accepts client connections.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::{info, warn};

use super::job::{CallbackJob, JobAction};
use super::multiplexer::SocketMultiplexer;
use super::SocketError;
use crate::event::{names, Event, EventQueue, EventTarget};
use crate::mt::lock;

/// A connection accepted by a [`ClientListener`].
#[derive(Debug)]
pub struct AcceptedConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Accepts connections on the multiplexer thread.
///
/// Each accepted connection is parked in a queue and announced with one
/// `listener.accepted` event addressed to [`ClientListener::target`]; the
/// handler collects it with [`ClientListener::next_client`].  Dropping the
/// listener closes the socket.
pub struct ClientListener {
    target: EventTarget,
    local_addr: SocketAddr,
    accepted: Arc<Mutex<VecDeque<AcceptedConnection>>>,
    multiplexer: Arc<SocketMultiplexer>,
}

impl ClientListener {
    /// Binds `addr` and starts accepting.
    ///
    /// # Errors
    ///
    /// [`SocketError::AddressInUse`] if another socket holds the address;
    /// [`SocketError::Bind`] for any other bind failure.
    pub fn open(
        addr: SocketAddr,
        events: Arc<EventQueue>,
        multiplexer: Arc<SocketMultiplexer>,
    ) -> Result<Self, SocketError> {
        let listener = std::net::TcpListener::bind(addr).map_err(|source| match source.kind() {
            io::ErrorKind::AddrInUse => SocketError::AddressInUse { addr },
            _ => SocketError::Bind { addr, source },
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener);

        let target = EventTarget::allocate();
        let accepted = Arc::new(Mutex::new(VecDeque::new()));
        let accepted_type = events.register_type(names::LISTENER_ACCEPTED);
        let queue = Arc::clone(&accepted);
        let job = CallbackJob::new(listener, Interest::READABLE, move |listener: &mut TcpListener, _ready| {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        lock(&queue).push_back(AcceptedConnection { stream, peer });
                        events.add_event(Event::new(accepted_type, target));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
            JobAction::Keep
        });
        multiplexer.add_socket(target, job)?;
        info!("listening for clients on {local_addr}");

        Ok(Self {
            target,
            local_addr,
            accepted,
            multiplexer,
        })
    }

    pub fn target(&self) -> EventTarget {
        self.target
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Takes the oldest accepted connection.
    pub fn next_client(&self) -> Option<AcceptedConnection> {
        lock(&self.accepted).pop_front()
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        self.multiplexer.remove_socket(self.target);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn multiplexer() -> Arc<SocketMultiplexer> {
        Arc::new(SocketMultiplexer::with_fatal_handler(Arc::new(|_: &str| {})).expect("multiplexer"))
    }

    #[test]
    fn test_open_reports_address_in_use() {
        // Arrange
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        // Act
        let result = ClientListener::open(addr, EventQueue::new(), multiplexer());

        // Assert
        assert!(matches!(result, Err(SocketError::AddressInUse { addr: a }) if a == addr));
    }

    #[test]
    fn test_accepted_connection_raises_event() {
        // Arrange
        let events = EventQueue::new();
        let listener = ClientListener::open("127.0.0.1:0".parse().unwrap(), Arc::clone(&events), multiplexer())
            .expect("listener");

        // Act
        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let event = events.get_event(Some(Duration::from_secs(5))).expect("accepted event");

        // Assert
        assert_eq!(event.kind(), events.register_type(names::LISTENER_ACCEPTED));
        assert_eq!(event.target(), listener.target());
        assert!(listener.next_client().is_some());
        assert!(listener.next_client().is_none());
    }

    #[test]
    fn test_drop_frees_the_port() {
        let mux = multiplexer();
        let listener = ClientListener::open("127.0.0.1:0".parse().unwrap(), EventQueue::new(), Arc::clone(&mux))
            .expect("listener");
        let addr = listener.local_addr();

        drop(listener);

        assert_eq!(mux.socket_count(), 0);
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }
}
