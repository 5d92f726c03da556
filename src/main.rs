mod auth;
mod config;
mod connection;
mod forward;
mod logging;
mod proxy;
mod relay;
mod tunnel;

use crate::config::{Cli, ProxyConfig};
use crate::connection::TunnelGuard;
use crate::proxy::{serve_connection, Proxy};
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{info, warn};

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    color_eyre::install()?;

    let args = Cli::parse();

    // Built once; every connection shares the same read-only config
    let config = Arc::new(ProxyConfig::from_cli(args)?);
    let proxy = Proxy::new(Arc::clone(&config));

    let listener = TcpListener::bind(config.listen_addr).await?;

    info!("HTTP Proxy listening on http://{}", config.listen_addr);
    info!("Dial timeout: {:?}", proxy.config().timeout);
    if proxy.config().credentials.is_some() {
        info!("Proxy authentication enabled");
    }

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");

        let active = TunnelGuard::active_count();
        if active > 0 {
            warn!("Stopping with {} tunnels still active", active);
        }
    };

    let server = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tokio::task::spawn(serve_connection(proxy.clone(), stream, peer_addr));
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    };

    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}
