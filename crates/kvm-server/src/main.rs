//! KVM-Over-IP server: entry point.
//!
//! Loads the configuration, opens the primary screen, listens for clients
//! and runs the event loop until a `Quit` event (Ctrl+C, the control
//! channel's `shutdown` command, or a terminal failure).
//!
//! # Usage
//!
//! ```text
//! kvm-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file [default: platform config dir]
//!   -n, --name <NAME>        This computer's screen name [default: host name]
//!   -a, --address <ADDR>     Listen address, `host` or `host:port`
//!       --port <PORT>        Listen port (overrides the configuration)
//!       --no-restart         Exit on the first failure instead of retrying
//!       --ipc-port <PORT>    Loopback port of the JSON control channel
//!       --log-level <LEVEL>  Log level when RUST_LOG is unset [default: info]
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | clean shutdown                            |
//! | 1    | the server failed and will not retry      |
//! | 2    | invalid command-line arguments            |
//! | 3    | unreadable or inconsistent configuration  |

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kvm_core::exit::{EXIT_ARGS, EXIT_CONFIG, EXIT_FAILURE, EXIT_SUCCESS};
use kvm_core::ipc::{ControlChannel, ControlOptions};
use kvm_core::mt::lock;
use kvm_core::net::{NetworkAddress, SocketError, SocketMultiplexer, DEFAULT_PORT};
use kvm_core::screen::HeadlessScreenFactory;
use kvm_core::EventQueue;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kvm_server::application::server_session::{prepare_config, ServerSession, SessionOptions};
use kvm_server::infrastructure::storage::config::{config_file_path, load_config, ConfigError, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// KVM-Over-IP server.
#[derive(Debug, Parser)]
#[command(
    name = "kvm-server",
    about = "Shares this computer's keyboard and mouse with KVM-Over-IP clients",
    version
)]
struct Cli {
    /// Configuration file.  A missing file means "use the defaults".
    #[arg(short, long, env = "KVM_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Screen name of this computer.  Must match a configured screen (or
    /// one of its aliases) unless the configuration lists no screens.
    #[arg(short, long, env = "KVM_SCREEN_NAME")]
    name: Option<String>,

    /// Address to listen on, `host` or `host:port`.
    #[arg(short, long, env = "KVM_SERVER_ADDRESS")]
    address: Option<String>,

    /// Port to listen on.  Wins over a port given in `--address`.
    #[arg(long, env = "KVM_SERVER_PORT")]
    port: Option<u16>,

    /// Exit on a recoverable failure instead of retrying.
    #[arg(long)]
    no_restart: bool,

    /// Loopback port for the JSON control channel.  Disabled when absent.
    #[arg(long, env = "KVM_IPC_PORT")]
    ipc_port: Option<u16>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "KVM_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    fn screen_name(&self) -> String {
        self.name.clone().unwrap_or_else(local_screen_name)
    }

    /// `--address` as given, with `--port` (or the default port) filling in
    /// a missing port.
    fn requested_address(&self) -> Result<Option<NetworkAddress>, SocketError> {
        self.address
            .as_deref()
            .map(|text| NetworkAddress::parse(text, self.port.unwrap_or(DEFAULT_PORT)))
            .transpose()
    }

    /// [`requested_address`](Self::requested_address), with a malformed
    /// address reported as an argument error.
    fn checked_address(&self) -> Result<Option<NetworkAddress>, i32> {
        self.requested_address().map_err(|e| {
            error!("invalid --address: {e}");
            EXIT_ARGS
        })
    }

    /// Listen address that overrides the configuration's, if any.
    fn listen_override(
        &self,
        address: Option<NetworkAddress>,
        config: &ServerConfig,
    ) -> Option<NetworkAddress> {
        match (address, self.port) {
            (Some(address), Some(port)) => Some(NetworkAddress::new(address.host(), port)),
            (Some(address), None) => Some(address),
            (None, Some(port)) => Some(NetworkAddress::new(config.network.address.clone(), port)),
            (None, None) => None,
        }
    }
}

/// The host name, or `localhost` when the environment does not say.
fn local_screen_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return exit_code(if e.use_stderr() { EXIT_ARGS } else { EXIT_SUCCESS });
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let address = match cli.checked_address() {
        Ok(address) => address,
        Err(code) => return exit_code(code),
    };

    match run(cli, address) {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!("{e:#}");
            let code = if e.downcast_ref::<ConfigError>().is_some() {
                EXIT_CONFIG
            } else {
                EXIT_FAILURE
            };
            exit_code(code)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli, address: Option<NetworkAddress>) -> anyhow::Result<i32> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => config_file_path().ok(),
    };
    let config = match &path {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    let mut options = SessionOptions::new(cli.screen_name(), &config);
    options.restartable = options.restartable && !cli.no_restart;
    options.config_path = path;
    options.address = cli.listen_override(address, &config);

    let config = prepare_config(config, &options);
    if !config.is_known_screen(&options.name) {
        return Err(ConfigError::UnknownScreen { name: options.name }.into());
    }

    info!("KVM-Over-IP server \"{}\" starting", options.name);

    // ── Services ──────────────────────────────────────────────────────────────
    let events = EventQueue::new();
    let multiplexer = Arc::new(SocketMultiplexer::new()?);
    let _control = ControlChannel::spawn(
        Arc::clone(&events),
        ControlOptions {
            listen: cli.ipc_port.map(|port| ([127, 0, 0, 1], port).into()),
            handle_signals: true,
        },
    )?;

    let session = ServerSession::new(
        Arc::clone(&events),
        multiplexer,
        Box::new(HeadlessScreenFactory),
        config,
        options,
    );

    // A failed start here is terminal; recoverable failures arm retry timers
    // that the loop services.
    if lock(&session).start_server().is_err() {
        lock(&session).cleanup_server();
        return Ok(EXIT_FAILURE);
    }

    events.run_loop();

    info!("stopping server");
    let failed = lock(&session).has_failed();
    lock(&session).cleanup_server();
    info!("stopped server");
    Ok(if failed { EXIT_FAILURE } else { EXIT_SUCCESS })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
