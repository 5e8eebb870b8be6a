use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use galley_core::config::Config;
use galley_core::logging::{init_logging_with_config, LogConfig};
use galley_core::metrics::init_metrics;
use galley_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use galley_core::{Gateway, SqliteStore};
use galley_server::{AppState, GalleyServer};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "galley-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

/// File (or defaults), then `GALLEY_*` variables, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging_with_config(LogConfig::try_from(&config.logging)?)?;
    init_metrics();

    let store = Arc::new(
        SqliteStore::from_config(&config.store)
            .with_context(|| format!("opening {}", config.store.database_path.display()))?,
    );
    info!(database = %config.store.database_path.display(), "Store ready");

    let gateway = Arc::new(Gateway::new(config.realtime.clone(), store.clone(), store));
    let shutdown = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));
    install_signal_handlers(shutdown.clone())?;

    if config.server.relay_token.is_none() {
        warn!(bind = %config.server.bind_address, "No relay token; the domain event endpoint is open to loopback callers");
    }

    let state = AppState::new(gateway, shutdown.clone(), config.server.clone());
    GalleyServer::new(state).run().await?;

    shutdown.wait_until_stopped().await;
    info!("Galley stopped");
    Ok(())
}
