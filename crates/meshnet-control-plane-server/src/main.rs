//! Daemon entry point for the Control Plane Server (spec.md §4.9).
//!
//! Thin like the relay forwarder's binary (spec.md §10): parse config from
//! CLI/env, open the database, build the `axum::Router`, serve it, and run
//! the cleanup sweep loop alongside it until shutdown.

use anyhow::Context;
use clap::Parser;
use meshnet_control_plane_server::{cleanup, connect, router, AppState, DEFAULT_TOKEN_TTL};
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(name = "meshnet-control-plane-server", about = "Authoritative party/peer/relay registry for LANrage mesh")]
struct Args {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "LANRAGE_CONTROL_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// `sqlx` database URL; defaults to an on-disk SQLite file next to the
    /// process. Use `sqlite::memory:` for ephemeral test deployments.
    #[arg(long, env = "LANRAGE_CONTROL_DATABASE_URL", default_value = "sqlite://control-plane.sqlite3?mode=rwc")]
    database_url: String,

    /// Maximum number of pooled database connections.
    #[arg(long, env = "LANRAGE_CONTROL_MAX_DB_CONNECTIONS", default_value_t = 10)]
    max_db_connections: u32,

    /// Bearer token lifetime in seconds (spec.md §4.9 default 24 hours).
    #[arg(long, env = "LANRAGE_CONTROL_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL.as_secs())]
    token_ttl_secs: u64,

    /// `tracing-subscriber` `EnvFilter` directives.
    #[arg(long, env = "LANRAGE_LOG", default_value = "info")]
    log: String,

    /// Emit logs as newline-delimited JSON instead of human-readable text.
    #[arg(long, env = "LANRAGE_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    meshnet_logging::setup_global_subscriber(&args.log, args.log_json)
        .context("failed to initialize logging")?;

    let pool = connect(&args.database_url, args.max_db_connections)
        .await
        .with_context(|| format!("failed to connect to {}", args.database_url))?;

    let cleanup_handle = cleanup::spawn(pool.clone());

    let state = AppState::new(pool, std::time::Duration::from_secs(args.token_ttl_secs));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.bind_addr))?;
    tracing::info!(bind_addr = %args.bind_addr, "control plane server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control plane server exited with an error")?;

    cleanup_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received shutdown signal");
    }
}
