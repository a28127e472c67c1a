//! PostgreSQL HTTP gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────▶ http server ──▶ routing ──▶ gateway handler
//!                                             │
//!                                             ▼
//!                                   upstream (balancer + peers)
//!                                             │
//!                                             ▼
//!                                   session pool ──▶ protocol machine ──▶ PostgreSQL
//!                                             │
//!                                   saved sessions ──▶ relay ──▶ /channels SSE
//!     Client Response
//!     ◀────── output (text / json / value / hex + result headers)
//! ```

use std::path::PathBuf;

use clap::Parser;

use pg_gateway::config::loader::load_config;
use pg_gateway::lifecycle::startup;
use pg_gateway::observability::logging;

#[derive(Parser)]
#[command(name = "pg-gateway")]
#[command(about = "HTTP gateway for PostgreSQL", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "pg-gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    logging::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        "pg-gateway starting"
    );

    startup::run(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
