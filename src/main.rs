//! tscached server binary.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tscached::config::{Cli, Config};
use tscached::orchestrator::Orchestrator;
use tscached::server::{build_router, AppState};
use tscached::store::RedisStore;
use tscached::upstream::HttpUpstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tscached=debug,tower_http=debug"
    } else {
        "tscached=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tscached v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        redis = %config.redis.url(),
        upstream = %config.upstream.query_url(),
        expiry_secs = config.cache.expiry_secs,
        staleness_threshold_secs = config.cache.staleness_threshold_secs,
        "Configuration loaded"
    );

    // Clients are constructed here and injected; the core never builds its
    // own.
    let store = Arc::new(RedisStore::connect(&config.redis.url()).await?);
    let upstream = Arc::new(HttpUpstream::new(&config.upstream));
    let orchestrator = Orchestrator::new(store, upstream, config.clone());

    let state = Arc::new(AppState { orchestrator });
    let app = build_router(state);

    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
