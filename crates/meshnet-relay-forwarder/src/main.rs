//! Daemon entry point for the Stateless Relay Forwarder (spec.md §4.10).
//!
//! This binary is deliberately thin: bind a socket, hand every datagram to
//! [`meshnet_relay_forwarder::Forwarder`], forward or drop per its verdict,
//! and sweep stale clients on a timer. All policy lives in the library.

use anyhow::Context;
use clap::Parser;
use meshnet_relay_forwarder::{Disposition, Forwarder, ForwarderConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration surface for the relay daemon, populated from the CLI or
/// from environment variables (spec.md §10 "daemons are configured via env
/// vars with CLI overrides, mirroring the teacher's `clap`+`env` pattern").
#[derive(Debug, Parser)]
#[command(name = "meshnet-relay-forwarder", about = "Stateless UDP relay for LANrage mesh traffic")]
struct Args {
    /// Address to bind the relay's UDP socket to.
    #[arg(long, env = "LANRAGE_RELAY_BIND_ADDR", default_value = "0.0.0.0:54000")]
    bind_addr: SocketAddr,

    /// Maximum number of distinct tunnel keys tracked at once.
    #[arg(long, env = "LANRAGE_RELAY_MAX_CLIENTS", default_value_t = meshnet_relay_forwarder::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Seconds of inactivity before a client entry is reaped.
    #[arg(long, env = "LANRAGE_RELAY_STALE_TIMEOUT_SECS", default_value_t = meshnet_relay_forwarder::DEFAULT_STALE_TIMEOUT.as_secs())]
    stale_timeout_secs: u64,

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

    let config = ForwarderConfig {
        max_clients: args.max_clients,
        stale_timeout: Duration::from_secs(args.stale_timeout_secs),
        ..ForwarderConfig::default()
    };
    let forwarder = Arc::new(Forwarder::new(config));

    let socket = Arc::new(
        meshnet_socket_factory::udp(args.bind_addr)
            .with_context(|| format!("failed to bind relay socket on {}", args.bind_addr))?,
    );
    tracing::info!(bind_addr = %args.bind_addr, "relay forwarder listening");

    let mut reap_ticker = tokio::time::interval(meshnet_relay_forwarder::DEFAULT_REAP_INTERVAL);
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, source) = match recv {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(%error, "failed to receive datagram");
                        continue;
                    }
                };

                match forwarder.ingest(&buf[..len], source) {
                    Disposition::Forward(dest) => {
                        if let Err(error) = socket.send_to(&buf[..len], dest).await {
                            tracing::warn!(%error, %source, %dest, "failed to forward datagram");
                        }
                    }
                    Disposition::Drop => {}
                }
            }
            _ = reap_ticker.tick() => {
                forwarder.reap_stale();
                tracing::debug!(
                    clients = forwarder.client_count(),
                    rejected = forwarder.rejected_new_clients(),
                    "reaped stale relay clients"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}
