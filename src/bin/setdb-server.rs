//! SetDB Server Binary
//!
//! Opens the store and serves RESP over TCP.

use std::sync::Arc;

use clap::Parser;
use setdb::network::Server;
use setdb::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// SetDB Server
#[derive(Parser, Debug)]
#[command(name = "setdb-server")]
#[command(about = "Redis-compatible data structure server on RocksDB")]
#[command(version)]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "db")]
    data_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "0.0.0.0:12345")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Block cache size in MB
    #[arg(short = 'c', long, default_value = "128")]
    cache_mb: usize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,setdb=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("SetDB v{}", setdb::VERSION);
    tracing::info!("store directory: {}", args.data_dir);
    tracing::info!("listen address: {}", args.listen);

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .block_cache_bytes(args.cache_mb * 1024 * 1024)
        .build();

    let engine = match Engine::open(config.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let mut server = match Server::bind(config, engine) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("server stopped");
}
