//! Replay proxy binary.
//!
//! ```text
//!   crawler ──HTTP(S)──▶ replay-proxy ──▶ fixtures/ (read-only)
//!                            │        ──▶ cache/    (recorded)
//!                            └──────── live ──▶ origin
//! ```
//!
//! Configuration comes from an optional TOML file, then CLI flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use replay_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use replay_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use replay_proxy::net::listener::Listener;
use replay_proxy::observability::{logging, metrics};
use replay_proxy::{Error, HttpServer};

#[derive(Debug, Parser)]
#[command(name = "replay-proxy", version, about = "Recording and replaying HTTP(S) proxy")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8055
    #[arg(long)]
    bind: Option<String>,

    /// Startup mode: replay, record, live or hybrid
    #[arg(long)]
    mode: Option<String>,

    #[arg(long)]
    fixtures_dir: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Fall back to recording on replay misses
    #[arg(long)]
    hybrid: bool,
}

impl Args {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(mode) = self.mode {
            config.mode.initial = mode;
        }
        if let Some(dir) = self.fixtures_dir {
            config.cache.fixtures_dir = dir;
        }
        if let Some(dir) = self.cache_dir {
            config.cache.cache_dir = dir;
        }
        if self.hybrid {
            config.mode.hybrid_fallback = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let mut args = Args::parse();

    let mut config = match args.config.take() {
        Some(path) => load_config(&path)?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "replay-proxy starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| Error::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    let server = HttpServer::new(&config)?;
    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
