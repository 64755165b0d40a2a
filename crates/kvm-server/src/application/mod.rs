//! Application layer of the server.
//!
//! # What lives here (for beginners)
//!
//! - **`server_session`** – The server lifecycle state machine.  Every
//!   transition happens inside an event handler, so the session never needs
//!   a thread of its own; it creates timers for retries and sockets for
//!   listening and lets the event queue call it back.

pub mod server_session;
