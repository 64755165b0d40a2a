//! Local control channel and signal watcher.
//!
//! # What it does (for beginners)
//!
//! A daemon needs to be told things from outside: "reload your config",
//! "drop all clients and let them reconnect", "shut down".  This module is the
//! *watcher thread* that listens for those requests and turns each one into an
//! event on the [`EventQueue`].  It never touches session state itself.
//!
//! Two sources are watched:
//!
//! - **A loopback TCP endpoint.**  Each line a client writes is one JSON
//!   object such as `{"command":"reload_config"}`.  Every line gets one JSON
//!   reply line: `{"ok":true}` or `{"ok":false,"error":"..."}`.
//! - **Process signals** (optional).  Interrupt and terminate raise `Quit`;
//!   on Unix, hangup raises `reload_config`.
//!
//! The watcher runs its own single-threaded Tokio runtime on a dedicated OS
//! thread, so the rest of the process stays synchronous.
//!
//! # JSON discriminant
//!
//! ```json
//! {"command":"reload_config"}
//! {"command":"force_reconnect"}
//! {"command":"reset_server"}
//! {"command":"shutdown"}
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::event::{names, Event, EventQueue};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("cannot bind control channel on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot start control channel: {0}")]
    Start(#[source] std::io::Error),

    #[error("malformed control command: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Wire types ────────────────────────────────────────────────────────────────

/// A request read from the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    ReloadConfig,
    ForceReconnect,
    ResetServer,
    Shutdown,
}

impl ControlCommand {
    /// Parses one request line.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Malformed`] for anything that is not a known
    /// command object.
    pub fn parse(line: &str) -> Result<Self, IpcError> {
        Ok(serde_json::from_str(line)?)
    }

    /// The event this command raises.  Process-wide requests go to the
    /// queue's system target; `Shutdown` is `Quit`.
    pub fn to_event(self, events: &EventQueue) -> Event {
        let name = match self {
            Self::ReloadConfig => names::APP_RELOAD_CONFIG,
            Self::ForceReconnect => names::APP_FORCE_RECONNECT,
            Self::ResetServer => names::APP_RESET_SERVER,
            Self::Shutdown => return Event::quit(),
        };
        Event::new(events.register_type(name), events.system_target())
    }
}

/// Reply written for every request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

// ── ControlChannel ────────────────────────────────────────────────────────────

/// What the watcher thread listens to.
#[derive(Debug, Clone, Default)]
pub struct ControlOptions {
    /// Loopback address for the JSON endpoint; `None` disables it.
    pub listen: Option<SocketAddr>,
    /// Map process signals onto events.
    pub handle_signals: bool,
}

/// Handle to the running watcher thread.  Dropping it stops the thread.
pub struct ControlChannel {
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Binds the endpoint (if any) and starts the watcher thread.
    ///
    /// # Errors
    ///
    /// [`IpcError::Bind`] if the endpoint cannot be bound,
    /// [`IpcError::Start`] if the runtime or thread cannot be created.
    pub fn spawn(events: Arc<EventQueue>, options: ControlOptions) -> Result<Self, IpcError> {
        // Bind synchronously so a bad port is reported to the caller and the
        // chosen port is known before the thread starts.
        let listener = match options.listen {
            Some(addr) => {
                let listener = std::net::TcpListener::bind(addr).map_err(|source| IpcError::Bind { addr, source })?;
                listener.set_nonblocking(true).map_err(IpcError::Start)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr().map_err(IpcError::Start)?),
            None => None,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(IpcError::Start)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle_signals = options.handle_signals;

        let thread = std::thread::Builder::new()
            .name("control-channel".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match listener.map(TcpListener::from_std).transpose() {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!("control channel unavailable: {e}");
                            None
                        }
                    };
                    serve(events, listener, handle_signals, shutdown_rx).await;
                });
            })
            .map_err(IpcError::Start)?;

        if let Some(addr) = local_addr {
            info!("control channel listening on {addr}");
        }
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Bound address of the JSON endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ── Watcher ───────────────────────────────────────────────────────────────────

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn interrupt(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot watch for interrupt: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
fn unix_signal(enabled: bool, kind: tokio::signal::unix::SignalKind) -> Option<tokio::signal::unix::Signal> {
    if !enabled {
        return None;
    }
    match tokio::signal::unix::signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("cannot watch for signal: {e}");
            None
        }
    }
}

#[cfg(unix)]
async fn next_signal(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            if signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn next_signal(_signal: &mut Option<()>) {
    std::future::pending().await
}

async fn serve(
    events: Arc<EventQueue>,
    listener: Option<TcpListener>,
    handle_signals: bool,
    mut shutdown: oneshot::Receiver<()>,
) {
    #[cfg(unix)]
    let (mut hangup, mut terminate) = (
        unix_signal(handle_signals, tokio::signal::unix::SignalKind::hangup()),
        unix_signal(handle_signals, tokio::signal::unix::SignalKind::terminate()),
    );
    #[cfg(not(unix))]
    let (mut hangup, mut terminate): (Option<()>, Option<()>) = (None, None);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = accept(&listener) => match accepted {
                Ok((stream, peer)) => {
                    debug!("control connection from {peer}");
                    tokio::spawn(handle_connection(stream, Arc::clone(&events)));
                }
                Err(e) => warn!("control channel accept failed: {e}"),
            },
            () = interrupt(handle_signals) => {
                info!("interrupted, quitting");
                events.add_event(Event::quit());
            }
            () = next_signal(&mut terminate) => {
                info!("terminated, quitting");
                events.add_event(Event::quit());
            }
            () = next_signal(&mut hangup) => {
                info!("hangup, reloading configuration");
                events.add_event(ControlCommand::ReloadConfig.to_event(&events));
            }
        }
    }
    debug!("control channel stopped");
}

/// Serves one control connection until the peer closes it.
async fn handle_connection(stream: TcpStream, events: Arc<EventQueue>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("control connection read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match ControlCommand::parse(&line) {
            Ok(command) => {
                info!("control command: {command:?}");
                events.add_event(command.to_event(&events));
                ControlReply::ok()
            }
            Err(e) => {
                warn!("{e}");
                ControlReply::error(e.to_string())
            }
        };
        let mut text = match serde_json::to_string(&reply) {
            Ok(text) => text,
            Err(e) => {
                warn!("cannot encode control reply: {e}");
                break;
            }
        };
        text.push('\n');
        if writer.write_all(text.as_bytes()).await.is_err() {
            break;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
