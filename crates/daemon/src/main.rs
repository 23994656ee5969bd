//! shellbridge
//!
//! Relays an interactive shell through a chat room.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shellbridge::chat_protocol::ChatTransport;
use shellbridge::config::{default_config_path, Config, TransportKind};
use shellbridge::network::{ConsoleTransport, MatrixTransport};
use shellbridge::{
    AuthorizationPolicy, BridgeController, BridgeEvent, BridgeSettings, CommandGrammar, PtyProcess,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// shellbridge - relay an interactive shell through a chat room.
#[derive(Parser, Debug)]
#[command(name = "shellbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the bridge
    Start(StartArgs),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Overrides for `start`; each one replaces the configured value.
#[derive(clap::Args, Debug, Clone, Default, PartialEq)]
pub struct StartArgs {
    /// Homeserver URL
    #[arg(long, value_name = "URL")]
    pub homeserver: Option<String>,

    /// Account to log in as
    #[arg(long, value_name = "USER_ID")]
    pub user: Option<String>,

    /// Password for the account
    #[arg(long)]
    pub password: Option<String>,

    /// Sender allowed to run commands (repeatable)
    #[arg(long = "allow", value_name = "USER_ID")]
    pub allow: Vec<String>,

    /// Shell to run
    #[arg(long)]
    pub shell: Option<String>,

    /// Room to join and relay output to (repeatable)
    #[arg(long = "room", value_name = "ROOM_ID")]
    pub room: Vec<String>,

    /// Use stdin/stdout instead of a homeserver
    #[arg(long)]
    pub console: bool,
}

/// Subcommands for the configuration file.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets masked)
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

impl StartArgs {
    /// Applies the command-line overrides on top of file and environment.
    fn apply(&self, config: &mut Config) {
        if let Some(ref homeserver) = self.homeserver {
            config.transport.homeserver = homeserver.clone();
        }
        if let Some(ref user) = self.user {
            config.transport.user_id = user.clone();
        }
        if let Some(ref password) = self.password {
            config.transport.password = Some(password.clone());
        }
        if !self.allow.is_empty() {
            config.auth.allowed_senders = self.allow.clone();
        }
        if let Some(ref shell) = self.shell {
            config.shell.command = shell.clone();
        }
        for room in &self.room {
            if !config.bridge.rooms.contains(room) {
                config.bridge.rooms.push(room.clone());
            }
        }
        if self.console {
            config.transport.kind = TransportKind::Console;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides, then command-line flags
    let env_overrides = config.apply_env_overrides();
    if let Commands::Start(ref args) = cli.command {
        args.apply(&mut config);
    }

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);
    for key in env_overrides {
        tracing::debug!("Applied environment override {}", key);
    }

    match cli.command {
        Commands::Start(_) => {
            config.validate().context("Invalid configuration")?;
            run_bridge(config).await
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.redacted().to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config(&config_path, force)?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing. Logs go to stderr, or to `daemon.log_file` when set;
/// stdout is left to the console transport.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    // --verbose wins over RUST_LOG, which wins over the config file.
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    let Some(ref path) = config.daemon.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Write the default configuration, refusing to clobber an existing file.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

/// Spawn the shell and run the bridge on the configured transport.
async fn run_bridge(config: Config) -> anyhow::Result<ExitCode> {
    tracing::info!("shellbridge starting...");

    let shell = PtyProcess::spawn(&config.shell)
        .with_context(|| format!("Failed to start shell {}", config.shell.command))?;
    let settings = BridgeSettings::from_config(&config);
    let grammar = CommandGrammar::from(&config.input);

    match config.transport.kind {
        TransportKind::Matrix => {
            let transport = Arc::new(MatrixTransport::new(&config.transport)?);
            let policy = AuthorizationPolicy::new(config.auth.allowed_senders.clone());
            tracing::info!(
                homeserver = %config.transport.homeserver,
                allowed = policy.len(),
                "Using Matrix transport"
            );
            drive(BridgeController::new(settings, transport, shell, policy, grammar)).await
        }
        TransportKind::Console => {
            let sender = config.console.sender.clone();
            let transport = Arc::new(ConsoleTransport::stdio(sender.clone()));
            // Whoever is at the console may always type.
            let policy = AuthorizationPolicy::new(
                config
                    .auth
                    .allowed_senders
                    .iter()
                    .cloned()
                    .chain(std::iter::once(sender)),
            );
            drive(BridgeController::new(settings, transport, shell, policy, grammar)).await
        }
    }
}

/// Run a controller until it stops, wiring shutdown signals and event logs.
async fn drive<T: ChatTransport + 'static>(controller: BridgeController<T>) -> anyhow::Result<ExitCode> {
    let shutdown = controller.shutdown_token();
    let mut events = controller.subscribe();

    // Spawn event logging task
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::StateChanged(state) => tracing::debug!("Bridge state: {:?}", state),
                BridgeEvent::Connecting { attempt } if attempt > 1 => {
                    tracing::info!("Reconnect attempt {}", attempt)
                }
                BridgeEvent::Connecting { .. } => {}
                BridgeEvent::RoomAdmitted { room_id } => tracing::info!("Relaying output to {}", room_id),
                BridgeEvent::ChunkRelayed { rooms, bytes } => {
                    tracing::trace!("Relayed {} bytes to {} rooms", bytes, rooms)
                }
            }
        }
    });

    // Wait for shutdown signal (SIGTERM or SIGINT)
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
        }
    });

    let reason = controller.run().await.context("Bridge failed")?;
    tracing::info!(reason = ?reason, "shellbridge stopped");
    Ok(ExitCode::from(reason.exit_code() as u8))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
