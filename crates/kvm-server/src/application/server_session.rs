//! Server lifecycle state machine.
//!
//! # States (for beginners)
//!
//! ```text
//! Uninitialized --init ok--------------------------> Initialized
//! Uninitialized --screen unavailable, restartable--> Initializing   (retry timer)
//! Initializing  --retry timer, init ok-------------> Initialized
//! Initialized   --listen ok------------------------> Started
//! Initialized   --port in use, restartable---------> Starting       (retry timer)
//! Starting      --retry timer, listen ok-----------> Started
//! Initializing  --start requested------------------> InitializingToStart
//! InitializingToStart --retry timer, init ok-------> Started (or back to waiting)
//! Started       --stop-----------------------------> Initialized
//! Initialized / Initializing* --cleanup------------> Uninitialized
//! ```
//!
//! "Initialized" means the primary screen is open; "Started" means the
//! listener and the [`Server`] exist as well.  A retry timer exists exactly
//! while the session is waiting in `Initializing`, `InitializingToStart` or
//! `Starting`.
//!
//! # Threading
//!
//! The session lives in an `Arc<Mutex<ServerSession>>`.  Every handler it
//! registers holds only a `Weak` to it, locks it, and calls one method, so
//! all transitions run one at a time on the event loop thread.
//!
//! # Failures
//!
//! Operations return `Err` only for *terminal* failures.  A recoverable
//! failure (screen unavailable, port in use) on a restartable session arms
//! the retry timer and returns `Ok`.  A terminal failure inside a handler
//! raises `Quit`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use kvm_core::event::{names, Event, EventQueue, EventTarget, EventType, TimerHandle};
use kvm_core::mt::lock;
use kvm_core::net::{ClientListener, NetworkAddress, SocketError, SocketMultiplexer};
use kvm_core::screen::{Screen, ScreenError, ScreenFactory};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::infrastructure::primary_client::PrimaryClient;
use crate::infrastructure::server::Server;
use crate::infrastructure::storage::config::{load_config, ConfigError, ServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Uninitialized,
    Initializing,
    InitializingToStart,
    Initialized,
    Starting,
    Started,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::InitializingToStart => "initializing (start pending)",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Started => "started",
        };
        f.write_str(name)
    }
}

/// A terminal failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown screen name `{0}`")]
    UnknownScreen(String),

    #[error("failed to open primary screen: {0}")]
    Screen(#[from] ScreenError),

    #[error("cannot listen for clients: {0}")]
    Listen(#[from] SocketError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// This computer's screen name, as given on the command line.
    pub name: String,
    /// Retry recoverable failures instead of failing.
    pub restartable: bool,
    /// Wait before retrying when the listen port is taken.
    pub address_in_use_backoff: Duration,
    /// File re-read on `app.reload_config`.
    pub config_path: Option<PathBuf>,
    /// Listen address that overrides the configuration's.
    pub address: Option<NetworkAddress>,
}

impl SessionOptions {
    pub fn new(name: impl Into<String>, config: &ServerConfig) -> Self {
        Self {
            name: name.into(),
            restartable: config.options.restartable,
            address_in_use_backoff: Duration::from_secs(config.options.address_in_use_backoff_secs),
            config_path: None,
            address: None,
        }
    }
}

/// Applies the command-line overrides to a freshly loaded configuration.
///
/// With no screens configured, the local screen becomes the only one.
pub fn prepare_config(mut config: ServerConfig, options: &SessionOptions) -> ServerConfig {
    if let Some(address) = &options.address {
        config.network.address = address.host().to_string();
        config.network.port = address.port();
    }
    if config.screens.is_empty() {
        config.add_screen(&options.name);
    }
    config
}

type Action = fn(&mut ServerSession, &Event);

pub struct ServerSession {
    this: Weak<Mutex<ServerSession>>,
    events: Arc<EventQueue>,
    multiplexer: Arc<SocketMultiplexer>,
    screens: Box<dyn ScreenFactory>,
    config: ServerConfig,
    options: SessionOptions,
    state: ServerState,
    history: Vec<ServerState>,
    server: Option<Server>,
    listener: Option<ClientListener>,
    primary_client: Option<PrimaryClient>,
    retry_timer: Option<TimerHandle>,
    suspended: bool,
    failed: bool,
}

impl ServerSession {
    /// Creates an `Uninitialized` session and registers its
    /// `app.reload_config`, `app.force_reconnect` and `app.reset_server`
    /// handlers on the queue's system target.
    pub fn new(
        events: Arc<EventQueue>,
        multiplexer: Arc<SocketMultiplexer>,
        screens: Box<dyn ScreenFactory>,
        config: ServerConfig,
        options: SessionOptions,
    ) -> Arc<Mutex<Self>> {
        let config = prepare_config(config, &options);
        let session = Arc::new_cyclic(|this| {
            Mutex::new(Self {
                this: this.clone(),
                events,
                multiplexer,
                screens,
                config,
                options,
                state: ServerState::Uninitialized,
                history: vec![ServerState::Uninitialized],
                server: None,
                listener: None,
                primary_client: None,
                retry_timer: None,
                suspended: false,
                failed: false,
            })
        });
        lock(&session).install_app_handlers();
        session
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Every state the session has entered, oldest first.
    pub fn state_history(&self) -> &[ServerState] {
        &self.history
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn primary_client(&self) -> Option<&PrimaryClient> {
        self.primary_client.as_ref()
    }

    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ClientListener::local_addr)
    }

    pub fn is_retry_pending(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// `true` once a terminal failure inside the event loop raised `Quit`.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Opens the primary screen.  No-op unless `Uninitialized`.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnknownScreen`] if the local name is not configured,
    /// [`ServerError::Screen`] if the screen cannot be opened (or is
    /// unavailable and the session is not restartable).
    pub fn init_server(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Uninitialized {
            return Ok(());
        }
        self.open_primary_client(ServerState::Initializing)
    }

    /// Opens the primary screen from `Uninitialized`.  An unavailable screen
    /// arms the retry timer and leaves the session in `waiting`.
    fn open_primary_client(&mut self, waiting: ServerState) -> Result<(), ServerError> {
        let Some(name) = self.config.canonical_name(&self.options.name).map(str::to_string) else {
            error!("unknown screen name `{}`", self.options.name);
            return Err(ServerError::UnknownScreen(self.options.name.clone()));
        };

        match self.open_server_screen() {
            Ok(screen) => {
                self.primary_client = Some(PrimaryClient::new(name, screen));
                self.set_state(ServerState::Initialized);
                Ok(())
            }
            Err(ScreenError::Unavailable { reason, retry_after }) if self.options.restartable => {
                warn!("primary screen unavailable: {reason}");
                self.start_retry_timer(retry_after);
                self.set_state(waiting);
                Ok(())
            }
            Err(e) => {
                error!("failed to start server: {e}");
                Err(e.into())
            }
        }
    }

    /// Initializes if needed, then starts listening for clients.
    ///
    /// Called while initialization is still being retried, this only records
    /// that the server should start once it is initialized.
    ///
    /// # Errors
    ///
    /// Any terminal [`init_server`](Self::init_server) failure, or
    /// [`ServerError::Listen`] when the listener cannot be opened.
    pub fn start_server(&mut self) -> Result<(), ServerError> {
        match self.state {
            ServerState::Starting | ServerState::Started => return Ok(()),
            ServerState::Initializing | ServerState::InitializingToStart => {
                self.set_state(ServerState::InitializingToStart);
                return Ok(());
            }
            ServerState::Uninitialized => {
                self.init_server()?;
                if self.state == ServerState::Initializing {
                    self.set_state(ServerState::InitializingToStart);
                    return Ok(());
                }
            }
            ServerState::Initialized => {}
        }
        debug_assert_eq!(self.state, ServerState::Initialized);
        self.open_server()
    }

    /// Closes the listener and all clients.  `Started` and `Starting` fall
    /// back to `Initialized`; other states are left alone.
    pub fn stop_server(&mut self) {
        match self.state {
            ServerState::Started => {
                self.close_server();
                self.close_client_listener();
                if let Some(primary) = self.primary_client.as_mut() {
                    primary.disable();
                }
                self.set_state(ServerState::Initialized);
            }
            ServerState::Starting => {
                self.stop_retry_timer();
                self.set_state(ServerState::Initialized);
            }
            _ => {}
        }
        debug_assert!(self.server.is_none() && self.listener.is_none());
    }

    /// Stops the server and closes the primary screen.  Always ends
    /// `Uninitialized`.
    pub fn cleanup_server(&mut self) {
        self.stop_server();
        match self.state {
            ServerState::Initialized => {
                self.close_primary_client();
                self.set_state(ServerState::Uninitialized);
            }
            ServerState::Initializing | ServerState::InitializingToStart => {
                self.stop_retry_timer();
                self.set_state(ServerState::Uninitialized);
            }
            _ => {}
        }
        debug_assert!(self.primary_client.is_none());
        debug_assert_eq!(self.state, ServerState::Uninitialized);
    }

    /// `stop_server` → `cleanup_server` → `start_server`.
    ///
    /// # Errors
    ///
    /// Terminal failures of the restart.
    pub fn reset_server(&mut self) -> Result<(), ServerError> {
        debug!("resetting server");
        self.stop_server();
        self.cleanup_server();
        self.start_server()
    }

    pub fn suspend(&mut self) {
        if !self.suspended {
            info!("suspend");
            self.stop_server();
            self.suspended = true;
        }
    }

    /// # Errors
    ///
    /// Terminal failures of the restart.
    pub fn resume(&mut self) -> Result<(), ServerError> {
        if !self.suspended {
            return Ok(());
        }
        info!("resume");
        self.suspended = false;
        self.start_server()
    }

    /// Re-reads the configuration file and hands it to a running server.
    ///
    /// A file that fails to load leaves the current configuration in place.
    pub fn reload_config(&mut self) {
        debug!("reload configuration");
        let Some(path) = self.options.config_path.clone() else {
            debug!("no configuration file to reload");
            return;
        };
        let config = match load_config(&path) {
            Ok(config) => prepare_config(config, &self.options),
            Err(e) => {
                error!("cannot read configuration \"{}\": {e}", path.display());
                return;
            }
        };
        if let Some(server) = self.server.as_mut() {
            if !server.set_config(config.clone()) {
                warn!("kept previous configuration");
                return;
            }
        }
        self.config = config;
        info!("reloaded configuration");
    }

    /// Drops every client so that they reconnect.
    pub fn force_reconnect(&mut self) {
        if let Some(server) = &self.server {
            server.disconnect();
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Wraps `action` as a queue handler that locks this session.
    fn bind(&self, action: Action) -> impl Fn(&Event) + Send + Sync + 'static {
        let this = self.this.clone();
        move |event| {
            if let Some(session) = this.upgrade() {
                action(&mut lock(&session), event);
            }
        }
    }

    fn install_app_handlers(&self) {
        let system = self.events.system_target();
        let handlers = [
            (names::APP_RELOAD_CONFIG, Self::handle_reload_config as Action),
            (names::APP_FORCE_RECONNECT, Self::handle_force_reconnect as Action),
            (names::APP_RESET_SERVER, Self::handle_reset_server as Action),
        ];
        for (name, action) in handlers {
            let kind = self.events.register_type(name);
            self.events.adopt_handler(kind, system, self.bind(action));
        }
    }

    fn remove_app_handlers(&self) {
        let system = self.events.system_target();
        for name in [names::APP_RELOAD_CONFIG, names::APP_FORCE_RECONNECT, names::APP_RESET_SERVER] {
            self.events.remove_handler(self.events.register_type(name), system);
        }
    }

    fn handle_reload_config(&mut self, _: &Event) {
        self.reload_config();
    }

    fn handle_force_reconnect(&mut self, _: &Event) {
        self.force_reconnect();
    }

    fn handle_reset_server(&mut self, _: &Event) {
        if self.reset_server().is_err() {
            self.fail();
        }
    }

    fn handle_retry(&mut self, _: &Event) {
        debug_assert!(matches!(
            self.state,
            ServerState::Initializing | ServerState::InitializingToStart | ServerState::Starting
        ));
        self.stop_retry_timer();
        if self.retry().is_err() {
            self.fail();
        }
    }

    /// Runs the step the retry timer was armed for.  The session is put back
    /// into the state that step starts from without recording it, so the
    /// history only shows where the retry lands.
    fn retry(&mut self) -> Result<(), ServerError> {
        let result = match self.state {
            ServerState::Initializing => {
                debug!("retry server initialization");
                self.state = ServerState::Uninitialized;
                self.open_primary_client(ServerState::Initializing)
            }
            ServerState::InitializingToStart => {
                debug!("retry server initialization");
                self.state = ServerState::Uninitialized;
                self.open_primary_client(ServerState::InitializingToStart)
                    .and_then(|()| {
                        if self.state == ServerState::Initialized {
                            debug!("starting server");
                            self.open_server()
                        } else {
                            Ok(())
                        }
                    })
            }
            ServerState::Starting => {
                debug!("retry starting server");
                self.state = ServerState::Initialized;
                self.open_server()
            }
            _ => Ok(()),
        };
        if result.is_err() {
            // Record where the terminal failure left the session.
            self.set_state(self.state);
        }
        result
    }

    fn handle_client_connected(&mut self, _: &Event) {
        let (Some(listener), Some(server)) = (&self.listener, &self.server) else {
            return;
        };
        if let Some(connection) = listener.next_client() {
            if let Err(e) = server.adopt_client(connection) {
                warn!("cannot adopt client: {e}");
            }
        }
    }

    fn handle_screen_error(&mut self, _: &Event) {
        error!("error on screen");
        self.fail();
    }

    fn handle_suspend(&mut self, _: &Event) {
        self.suspend();
    }

    fn handle_resume(&mut self, _: &Event) {
        if self.resume().is_err() {
            self.fail();
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.events.quit();
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn screen_event_types(&self) -> [(EventType, Action); 3] {
        [
            (self.events.register_type(names::SCREEN_ERROR), Self::handle_screen_error as Action),
            (self.events.register_type(names::SCREEN_SUSPEND), Self::handle_suspend as Action),
            (self.events.register_type(names::SCREEN_RESUME), Self::handle_resume as Action),
        ]
    }

    fn open_server_screen(&mut self) -> Result<Box<dyn Screen>, ScreenError> {
        let screen = self.screens.open(&self.events)?;
        let target = screen.event_target();
        for (kind, action) in self.screen_event_types() {
            self.events.adopt_handler(kind, target, self.bind(action));
        }
        Ok(screen)
    }

    fn close_primary_client(&mut self) {
        if let Some(primary) = self.primary_client.take() {
            let target = primary.screen_target();
            for (kind, _) in self.screen_event_types() {
                self.events.remove_handler(kind, target);
            }
        }
    }

    fn open_server(&mut self) -> Result<(), ServerError> {
        let addr = match self.config.listen_address() {
            Ok(addr) => addr,
            Err(e) => {
                error!("failed to start server: {e}");
                return Err(e.into());
            }
        };

        match ClientListener::open(addr, Arc::clone(&self.events), Arc::clone(&self.multiplexer)) {
            Ok(listener) => {
                let accepted = self.events.register_type(names::LISTENER_ACCEPTED);
                self.events
                    .adopt_handler(accepted, listener.target(), self.bind(Self::handle_client_connected));
                let name = self
                    .primary_client
                    .as_ref()
                    .map_or_else(|| self.options.name.clone(), |primary| primary.name().to_string());
                let server = Server::new(
                    self.config.clone(),
                    &name,
                    Arc::clone(&self.events),
                    Arc::clone(&self.multiplexer),
                );
                if let Some(primary) = self.primary_client.as_mut() {
                    primary.enable();
                }
                info!("started server on {}, waiting for clients", listener.local_addr());
                self.listener = Some(listener);
                self.server = Some(server);
                self.set_state(ServerState::Started);
                Ok(())
            }
            Err(e @ SocketError::AddressInUse { .. }) if self.options.restartable => {
                warn!("cannot listen for clients: {e}");
                self.start_retry_timer(self.options.address_in_use_backoff);
                self.set_state(ServerState::Starting);
                Ok(())
            }
            Err(e) => {
                error!("cannot listen for clients: {e}");
                Err(e.into())
            }
        }
    }

    fn close_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.disconnect();
        }
    }

    fn close_client_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            let accepted = self.events.register_type(names::LISTENER_ACCEPTED);
            self.events.remove_handler(accepted, listener.target());
        }
    }

    fn start_retry_timer(&mut self, after: Duration) {
        debug_assert!(self.retry_timer.is_none());
        let after = after.max(Duration::from_millis(1));
        debug!("retry in {:.0} seconds", after.as_secs_f64());
        let timer = self.events.new_one_shot_timer(after, None);
        self.events
            .adopt_handler(EventType::TIMER, timer.target(), self.bind(Self::handle_retry));
        self.retry_timer = Some(timer);
    }

    fn stop_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            self.events.remove_handler(EventType::TIMER, timer.target());
            self.events.delete_timer(timer);
        }
    }

    fn set_state(&mut self, state: ServerState) {
        self.state = state;
        let previous = self.history.last().copied();
        if previous != Some(state) {
            if let Some(previous) = previous {
                debug!("server {previous} -> {state}");
            }
            self.history.push(state);
        }
        self.check_invariants();
    }

    fn check_invariants(&self) {
        let started = self.state == ServerState::Started;
        debug_assert_eq!(self.server.is_some(), started, "server present in state {}", self.state);
        debug_assert_eq!(self.listener.is_some(), started, "listener present in state {}", self.state);
        debug_assert_eq!(
            self.primary_client.is_some(),
            matches!(
                self.state,
                ServerState::Initialized | ServerState::Starting | ServerState::Started
            ),
            "primary client present in state {}",
            self.state
        );
        debug_assert_eq!(
            self.retry_timer.is_some(),
            matches!(
                self.state,
                ServerState::Initializing | ServerState::InitializingToStart | ServerState::Starting
            ),
            "retry timer present in state {}",
            self.state
        );
    }

    /// Target of the primary screen's events, while it is open.
    pub fn primary_screen_target(&self) -> Option<EventTarget> {
        self.primary_client.as_ref().map(PrimaryClient::screen_target)
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.remove_app_handlers();
        self.cleanup_server();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
