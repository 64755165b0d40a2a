//! Event queue, timers, and the event value types.
//!
//! # Overview (for beginners)
//!
//! - **`types`** – [`Event`], [`EventType`], [`EventTarget`], [`TimerHandle`].
//! - **`timer`** – [`TimerQueue`], a min-heap of pending timers.
//! - **`buffer`** – the [`EventQueueBuffer`] trait that wakes the loop thread,
//!   and the default in-memory [`SimpleEventQueueBuffer`].
//! - **`queue`** – [`EventQueue`] itself: handler table, timers, dispatch.
//! - **`names`** – the names of the event types exchanged between crates.

pub mod buffer;
pub mod queue;
pub mod timer;
pub mod types;

pub use buffer::{BufferEvent, EventQueueBuffer, SimpleEventQueueBuffer};
pub use queue::{EventHandler, EventQueue, EventQueueError};
pub use timer::{Timer, TimerQueue};
pub use types::{Event, EventData, EventTarget, EventType, TimerEvent, TimerHandle};

/// Names of the event types shared across components.
///
/// Types are registered lazily with [`EventQueue::register_type`]; using the
/// same constant on both sides is what makes producer and consumer agree.
pub mod names {
    pub const SCREEN_ERROR: &str = "screen.error";
    pub const SCREEN_SUSPEND: &str = "screen.suspend";
    pub const SCREEN_RESUME: &str = "screen.resume";

    pub const SOCKET_CONNECTED: &str = "socket.connected";
    pub const SOCKET_CONNECTION_FAILED: &str = "socket.connection_failed";
    pub const SOCKET_DISCONNECTED: &str = "socket.disconnected";

    pub const LISTENER_ACCEPTED: &str = "listener.accepted";

    pub const CLIENT_CONNECTED: &str = "client.connected";
    pub const CLIENT_CONNECTION_FAILED: &str = "client.connection_failed";
    pub const CLIENT_CONNECTION_REFUSED: &str = "client.connection_refused";
    pub const CLIENT_DISCONNECTED: &str = "client.disconnected";

    pub const SERVER_CLIENT_CONNECTED: &str = "server.client_connected";
    pub const SERVER_CLIENT_DISCONNECTED: &str = "server.client_disconnected";
    pub const SERVER_DISCONNECTED: &str = "server.disconnected";

    pub const APP_RELOAD_CONFIG: &str = "app.reload_config";
    pub const APP_FORCE_RECONNECT: &str = "app.force_reconnect";
    pub const APP_RESET_SERVER: &str = "app.reset_server";
}
