//! Secure media-streaming gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────────┐
//!                         │                     STREAM GATEWAY                        │
//!                         │                                                           │
//!   GET /stream?url=...   │  ┌─────────┐   ┌────────┐   ┌──────┐   ┌──────────┐      │
//!   ──────────────────────┼─▶│  http   │──▶│ parser │──▶│ SSRF │──▶│ patterns │      │
//!                         │  │ server  │   │ (C1)   │   │ (C2) │   │ + referer│      │
//!                         │  └─────────┘   └────────┘   └──────┘   └────┬─────┘      │
//!                         │                                             ▼            │
//!                         │                ┌──────────┐          ┌────────────┐      │
//!   raw bytes 200 / 206   │                │  relay   │◀─────────│ rate limit │      │
//!   ◀─────────────────────┼────────────────│  (C5)    │          │   (C4)     │      │
//!                         │                └────┬─────┘          └────────────┘      │
//!                         │                     │ hardened DNS, redirect checks      │
//!                         │                     ▼                                    │
//!                         │               origin server ◀──────────────────────────┼──
//!                         │                                                           │
//!                         │  ┌─────────────────────────────────────────────────────┐ │
//!                         │  │  observability (C6): events, sampling, metrics      │ │
//!                         │  │  config + hot reload, lifecycle, TLS                │ │
//!                         │  └─────────────────────────────────────────────────────┘ │
//!                         └──────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use stream_gateway::config::loader::{load_config, load_from_env};
use stream_gateway::config::watcher::ConfigWatcher;
use stream_gateway::http::HttpServer;
use stream_gateway::lifecycle::{signals, Shutdown};
use stream_gateway::net::tls::load_tls_config;
use stream_gateway::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "stream-gateway", version)]
#[command(about = "Secure media-streaming proxy gateway", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults and GATEWAY_* variables apply when omitted.
    #[arg(short, long, env = "STREAM_GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_from_env()?,
    };

    logging::init_logging(&config.observability)?;

    tracing::info!("stream-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_concurrent_streams = config.listener.max_concurrent_streams,
        domain_allowlist = config.security.domain_allowlist.len(),
        rate_limit_max = config.rate_limit.max_requests,
        rate_limit_window_secs = config.rate_limit.window_secs,
        resolve_check = config.upstream.resolve_check,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let server = HttpServer::new(config.clone())?;

    // Hot reload of the security policy. The watcher stops when dropped.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            let gateway = server.gateway().clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(update) = updates.recv() => {
                            if let Err(e) = gateway.reload_policy(&update.security) {
                                tracing::error!(error = %e, "Rejected security policy update");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    match &config.listener.tls {
        Some(tls) => {
            let rustls = load_tls_config(tls).await?;
            let addr: SocketAddr = config.listener.bind_address.parse()?;
            server.run_tls(addr, rustls, &shutdown).await?;
        }
        None => {
            let listener = TcpListener::bind(&config.listener.bind_address).await?;
            tracing::info!(address = %listener.local_addr()?, "Listening for connections");
            server.run(listener, &shutdown).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
