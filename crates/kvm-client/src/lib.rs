//! kvm-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does kvm-client do? (for beginners)
//!
//! The *client* is the computer whose keyboard and mouse are controlled from
//! the server.  Its job here is to stay connected:
//!
//! 1. Open the local (secondary) screen once.
//! 2. Resolve the server's host name and connect to one of its addresses.
//! 3. When a connection attempt fails, try the next address straight away.
//! 4. When every address has failed, or an established connection drops,
//!    wait a second and start over (or exit, if restarting is disabled).
//!
//! Everything runs as handlers on the shared
//! [`EventQueue`](kvm_core::EventQueue); sockets are serviced by the
//! [`SocketMultiplexer`](kvm_core::net::SocketMultiplexer) thread.

/// Application layer: the client session state machine.
pub mod application;

/// Infrastructure layer: the server connection and address resolution.
pub mod infrastructure;
