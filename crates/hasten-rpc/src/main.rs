//! hasten-rpc: runs a discovery registry and/or an RPC server with the
//! built-in `ComputeS1` service, depending on which config sections are set.
//!
//! Usage: `hasten-rpc [config.yaml]` (default `hasten.yaml`).

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hasten_core::error::{Result, RpcError};
use hasten_rpc::config;
use hasten_rpc::discovery::DiscoveryRegistry;
use hasten_rpc::server::Server;
use hasten_rpc::services::ComputeS1;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "hasten.yaml".to_string());
    let cfg = config::load_from_file(&path)?;
    tracing::info!(config = %path, "hasten-rpc starting");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let registry = match &cfg.registry {
        Some(section) => {
            let listener = bind(&section.listen).await?;
            Some((DiscoveryRegistry::new(section.options()), listener))
        }
        None => None,
    };

    let server = match &cfg.server {
        Some(section) => {
            let listener = bind(&section.listen).await?;
            let server = Server::new(section.options());
            server.register_service(ComputeS1)?;
            Some((server, listener, section.listen.clone()))
        }
        None => None,
    };

    let registry_task = {
        let stop = stop_rx.clone();
        async move {
            match registry {
                Some((registry, listener)) => registry.serve_with_shutdown(listener, stopped(stop)).await,
                None => Ok(()),
            }
        }
    };

    let server_task = {
        let stop = stop_rx.clone();
        let discovery = cfg.discovery;
        async move {
            let Some((server, listener, listen)) = server else {
                return Ok(());
            };
            // Held until the server stops; dropping it ends the heartbeats.
            let _registration = match &discovery {
                Some(d) => {
                    let advertise = d.advertise_addr.clone().unwrap_or(listen);
                    Some(
                        server
                            .register_with_registry(&d.registry_addr, &d.service_name, Some(advertise), d.heartbeat_interval())
                            .await?,
                    )
                }
                None => None,
            };
            server.serve_with_shutdown(listener, stopped(stop)).await
        }
    };

    tokio::try_join!(registry_task, server_task)?;
    tracing::info!("hasten-rpc stopped");
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RpcError::Config(format!("bind {addr}: {e}")))
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("signal received, shutting down");
}
