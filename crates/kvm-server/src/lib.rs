//! # kvm-server
//!
//! The server side of KVM-Over-IP: it opens the primary screen, listens for
//! clients, and keeps that session alive across screen outages and port
//! conflicts.
//!
//! # Layers (for beginners)
//!
//! - **`application`** – [`application::server_session::ServerSession`], the
//!   state machine that decides when to open the screen, when to listen, and
//!   when to retry.  It runs entirely inside event handlers on the loop
//!   thread.
//! - **`infrastructure`** – The pieces the session drives: the `Server` that
//!   owns client connections, the `PrimaryClient` wrapping the local screen,
//!   and TOML configuration storage.

pub mod application;
pub mod infrastructure;
