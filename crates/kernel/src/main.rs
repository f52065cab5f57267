//! Hostdesk Kernel
//!
//! HTTP admin server and CLI for the plugin runtime.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hostdesk_kernel::config::Config;
use hostdesk_kernel::plugin::cli;
use hostdesk_kernel::routes;
use hostdesk_kernel::state::AppState;

/// Hostdesk control panel kernel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,

    /// Manage plugins.
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommand {
    /// List plugins on disk and in the registry.
    List,
    /// Sync the registry with the plugins directory.
    Reconcile,
    /// Load a plugin, apply its migrations and enable it.
    Enable { id: String },
    /// Disable a plugin.
    Disable { id: String },
    /// Show a plugin's lifecycle state and last error.
    Status { id: String },
    /// Show applied and pending migrations for a plugin.
    MigrateStatus { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    let args = Args::parse();

    // Load configuration from environment
    let config = Config::from_env().context("failed to load configuration")?;

    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, state).await,
        Command::Plugin { command } => run_plugin_command(command, &state).await,
    }
}

async fn run_plugin_command(command: PluginCommand, state: &AppState) -> Result<()> {
    let reconciler = state.reconciler();
    let dir = state.plugins_dir();

    let result = match command {
        PluginCommand::List => cli::cmd_plugin_list(reconciler, dir).await,
        PluginCommand::Reconcile => cli::cmd_plugin_reconcile(reconciler, dir).await,
        PluginCommand::Enable { id } => cli::cmd_plugin_enable(reconciler, dir, &id).await,
        PluginCommand::Disable { id } => cli::cmd_plugin_disable(reconciler, dir, &id).await,
        PluginCommand::Status { id } => cli::cmd_plugin_status(reconciler, dir, &id).await,
        PluginCommand::MigrateStatus { id } => {
            cli::cmd_plugin_migrate_status(reconciler, dir, &id).await
        }
    };

    // A one-shot command leaves enabled plugins enabled.
    reconciler.detach().await;
    result
}

async fn serve(config: &Config, state: AppState) -> Result<()> {
    info!("Starting Hostdesk kernel");

    let report = state
        .reconciler()
        .reconcile(state.plugins_dir())
        .await
        .context("initial plugin reconciliation failed")?;
    for duplicate in &report.duplicates {
        warn!(error = %duplicate, "duplicate plugin ignored");
    }

    let startup = state
        .reconciler()
        .start_enabled()
        .await
        .context("failed to start enabled plugins")?;
    info!(
        enabled = startup.enabled.len(),
        failed = startup.failed.len(),
        "Plugins started"
    );

    let reconciler = state.reconciler().clone();
    let app = routes::build_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    reconciler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
