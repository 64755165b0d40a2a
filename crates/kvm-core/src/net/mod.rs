//! Socket plumbing: the multiplexer and the jobs it services.
//!
//! # Overview (for beginners)
//!
//! All sockets are non-blocking and owned by a single
//! [`SocketMultiplexer`] thread that waits on them with `mio`.  When a socket
//! becomes ready the multiplexer runs the socket's [`SocketJob`]; jobs never
//! touch session state directly, they add events to the
//! [`EventQueue`](crate::event::EventQueue) and the loop thread reacts.
//!
//! - **`address`** – [`NetworkAddress`], host + port resolved on demand.
//! - **`job`** – the [`SocketJob`] trait and the closure-based [`CallbackJob`].
//! - **`job_list`** – the cursor-iterated list of registered jobs.
//! - **`multiplexer`** – [`SocketMultiplexer`], the service thread.
//! - **`listener`** – [`ClientListener`], accepts incoming connections.
//! - **`stream`** – [`StreamJob`], connects and watches a TCP stream.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub mod address;
pub mod job;
pub(crate) mod job_list;
pub mod listener;
pub mod multiplexer;
pub mod stream;

pub use address::{NetworkAddress, DEFAULT_PORT};
pub use job::{CallbackJob, JobAction, Readiness, SocketJob};
pub use listener::{AcceptedConnection, ClientListener};
pub use multiplexer::{FatalHandler, SocketMultiplexer};
pub use stream::{ConnectionFailed, StreamEvents, StreamJob};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("address already in use: {addr}")]
    AddressInUse { addr: SocketAddr },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid network address: {address:?}")]
    InvalidAddress { address: String },

    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses found for {host}")]
    NoAddress { host: String },

    #[error("socket multiplexer is not running")]
    MultiplexerStopped,

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}
