//! KVM-Over-IP client: entry point.
//!
//! Opens the secondary screen, connects to the server and runs the event
//! loop until a `Quit` event (Ctrl+C, the control channel's `shutdown`
//! command, or a terminal failure).
//!
//! # Usage
//!
//! ```text
//! kvm-client [OPTIONS] <SERVER>
//!
//! Arguments:
//!   <SERVER>  Server address, `host` or `host:port`
//!
//! Options:
//!   -n, --name <NAME>             This computer's screen name [default: host name]
//!       --no-restart              Exit on the first failure instead of retrying
//!       --connect-timeout <SECS>  Give up on a connection attempt after this long [default: 2]
//!       --ipc-port <PORT>         Loopback port of the JSON control channel
//!       --log-level <LEVEL>       Log level when RUST_LOG is unset [default: info]
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | clean shutdown                            |
//! | 1    | the client gave up                        |
//! | 2    | invalid command-line arguments            |

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kvm_core::exit::{EXIT_ARGS, EXIT_FAILURE, EXIT_SUCCESS};
use kvm_core::ipc::{ControlChannel, ControlOptions};
use kvm_core::mt::lock;
use kvm_core::net::{NetworkAddress, SocketMultiplexer, DEFAULT_PORT};
use kvm_core::screen::HeadlessScreenFactory;
use kvm_core::EventQueue;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kvm_client::application::client_session::{ClientOptions, ClientSession};
use kvm_client::infrastructure::resolver::DnsResolver;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// KVM-Over-IP client.
#[derive(Debug, Parser)]
#[command(
    name = "kvm-client",
    about = "Lets a KVM-Over-IP server control this computer's keyboard and mouse",
    version
)]
struct Cli {
    /// Server address, `host` or `host:port`.
    #[arg(env = "KVM_SERVER")]
    server: String,

    /// Screen name of this computer.
    #[arg(short, long, env = "KVM_SCREEN_NAME")]
    name: Option<String>,

    /// Exit on a failure instead of reconnecting.
    #[arg(long)]
    no_restart: bool,

    /// Seconds a single connection attempt may take.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    connect_timeout: u64,

    /// Loopback port for the JSON control channel.  Disabled when absent.
    #[arg(long, env = "KVM_IPC_PORT")]
    ipc_port: Option<u16>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "KVM_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    fn options(&self) -> anyhow::Result<ClientOptions> {
        let server = NetworkAddress::parse(&self.server, DEFAULT_PORT)?;
        let name = self.name.clone().unwrap_or_else(local_screen_name);
        let mut options = ClientOptions::new(name, server);
        options.restartable = !self.no_restart;
        options.connect_timeout = Duration::from_secs(self.connect_timeout);
        Ok(options)
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

    let options = match cli.options() {
        Ok(options) => options,
        Err(e) => {
            error!("invalid server address '{}': {e:#}", cli.server);
            return exit_code(EXIT_ARGS);
        }
    };

    match run(&cli, options) {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!("{e:#}");
            exit_code(EXIT_FAILURE)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: &Cli, options: ClientOptions) -> anyhow::Result<i32> {
    info!("KVM-Over-IP client \"{}\" starting, server {}", options.name, options.server);

    let events = EventQueue::new();
    let multiplexer = Arc::new(SocketMultiplexer::new()?);
    let _control = ControlChannel::spawn(
        Arc::clone(&events),
        ControlOptions {
            listen: cli.ipc_port.map(|port| ([127, 0, 0, 1], port).into()),
            handle_signals: true,
        },
    )?;

    let session = ClientSession::new(
        Arc::clone(&events),
        multiplexer,
        Box::new(HeadlessScreenFactory),
        Arc::new(DnsResolver),
        options,
    );

    if lock(&session).start_client().is_err() {
        lock(&session).cleanup_client();
        return Ok(EXIT_FAILURE);
    }

    events.run_loop();

    info!("stopping client");
    let mut session = lock(&session);
    session.cleanup_client();
    info!("stopped client");
    Ok(if session.has_failed() { EXIT_FAILURE } else { EXIT_SUCCESS })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
