//! Entry point for the terminal-mcp supervisor.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), loads configuration, wires up the Supervisor and its
//! optional History Store, and serves on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing_subscriber::{self, EnvFilter};

use terminal_mcp::config::Config;
use terminal_mcp::history::HistoryStore;
use terminal_mcp::manager::Manager;
use terminal_mcp::server::SupervisorServer;

/// Session & Process Supervisor: exposes shell sessions and background
/// process management over JSON-RPC stdio.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Force debug-level logging regardless of configured log level.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(config: &Config, debug: bool) {
    let level = if debug || config.server.debug { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_ansi(false);

    if config.logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config, cli.debug);
    tracing::info!("starting terminal-mcp supervisor v{}", env!("CARGO_PKG_VERSION"));

    // The store is optional: a connection failure degrades to in-memory
    // operation rather than a fatal error.
    let history = if config.database.enabled {
        match HistoryStore::new(config.database_path(), config.database.max_connections, config.database.busy_timeout_ms).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, "history store unavailable, continuing without persistence");
                None
            }
        }
    } else {
        None
    };

    let manager = Manager::new(config, history);
    manager.spawn_cleanup_tasks().await;

    let server = SupervisorServer::new(Arc::clone(&manager));
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!(error = ?e, "serving error");
    })?;
    service.waiting().await?;

    manager.shutdown().await;
    tracing::info!("supervisor shut down");
    Ok(())
}
