//! gpu-governor server binary.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use gpu_governor::config::{Cli, Config};
use gpu_governor::governor::Governor;
use gpu_governor::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gpu_governor=debug,tower_http=debug"
    } else {
        "gpu_governor=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gpu-governor v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        nodes = config.router.nodes.len(),
        rate_limit = config.firewall.rate_limit_per_minute,
        chain_max = config.chain.max_tokens,
        "Configuration loaded"
    );

    for node in &config.router.nodes {
        info!(
            node = %node.name,
            address = %node.address,
            capacity_mb = node.capacity_mb,
            capabilities = ?node.capabilities,
            "Node configured"
        );
    }

    // Build the governor and application state.
    let governor = Arc::new(Governor::new(config.clone()));
    let state = Arc::new(AppState {
        governor,
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
