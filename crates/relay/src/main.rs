//! ShellMux Relay Daemon
//!
//! Headless service that keeps shell sessions alive across client
//! reconnects and multiplexes them over one framed connection.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use relay::config::Config;
use relay::process::ShellSpawner;
use relay::registry::{RegistryLimits, SessionRegistry};
use relay::server;

/// ShellMux relay - session-preserving shell multiplexer daemon.
#[derive(Parser, Debug)]
#[command(name = "shellmux-relay")]
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

/// Available commands for the relay.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay daemon
    Start {
        /// Listen address, overriding the configuration file
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    config.apply_env_overrides();

    if let Commands::Start {
        listen: Some(addr), ..
    } = &cli.command
    {
        config.daemon.listen_addr = addr.clone();
    }

    config.validate()?;

    // Initialize tracing: -v forces debug, otherwise the configured level
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start { .. } => run(config).await,
        Commands::CheckConfig => {
            println!("Configuration OK");
            println!("  listen_addr:   {}", config.daemon.listen_addr);
            println!("  default_shell: {}", config.session.default_shell);
            println!("  max_sessions:  {}", config.session.max_sessions);
            println!("  grace_period:  {}s", config.session.grace_period_secs);
            Ok(())
        }
    }
}

/// Runs the relay until a shutdown signal arrives, then closes every
/// session before exiting.
async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("ShellMux relay starting");

    let addr = config.daemon.listen_addr.parse()?;
    let spawner = ShellSpawner::new(
        config.session.default_shell.clone(),
        Duration::from_secs(config.session.kill_timeout_secs),
    );
    let registry = SessionRegistry::new(spawner, RegistryLimits::from_config(&config.session));

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server::run(addr, registry.clone(), shutdown.clone()));

    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    registry.shutdown().await;

    match server_task.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!(error = %e, "Server task panicked"),
    }

    tracing::info!("ShellMux relay stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
