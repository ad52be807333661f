//! # Mutual-TLS connection broker
//!
//! Starts a broker that only admits clients presenting a certificate signed by
//! one of the configured trusted authorities.
//!
//! ## Features
//! - Credentials loaded from disk, or generated and persisted on first start
//! - Dynamic listening port inside a configured range
//! - Optional plain HTTP listener for `/health`, `/metrics` and 404s
//! - `SIGHUP` restarts the listener with regenerated credentials (Unix)
//! - Graceful shutdown on Ctrl+C

use mtls_broker::{
    config::BrokerConfig,
    server::{events::handler, health::serve_metrics_http},
    ConnectionBroker, CredentialSource, StartConfig,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BrokerConfig::from_env()?;
    config.validate()?;

    let mut broker = ConnectionBroker::new(config.listener_options()?);
    broker.add_client_middleware(
        "message",
        handler(|payload| info!("message event: {}", payload)),
    );

    let start_config = config.start_config();
    let handle = broker.start(&start_config).await?;
    info!("Accepting clients on {}:{}", handle.host, handle.port);

    if let Some(addr) = config.http_addr() {
        let metrics = broker.metrics().clone();
        let registry = broker.registry().clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics_http(addr, metrics, registry).await {
                error!("Health listener failed: {}", e);
            }
        });
    }

    run_until_shutdown(&mut broker, &start_config).await;

    info!("Shutting down gracefully");
    broker.stop().await?;
    Ok(())
}

/// Waits for Ctrl+C, restarting the broker with fresh credentials on SIGHUP.
#[cfg(unix)]
async fn run_until_shutdown(broker: &mut ConnectionBroker, start_config: &StartConfig) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGHUP handler unavailable: {}", e);
            shutdown_signal().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_signal() => return,
            _ = hangup.recv() => {
                info!("SIGHUP received, regenerating credentials");
                match broker.restart(&regenerate(start_config)).await {
                    Ok(handle) => info!("Restarted on {}:{}", handle.host, handle.port),
                    Err(e) => error!("Restart failed: {}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_until_shutdown(_broker: &mut ConnectionBroker, _start_config: &StartConfig) {
    shutdown_signal().await;
}

/// Same start parameters, but always generating new material at the same paths.
#[cfg_attr(not(unix), allow(dead_code))]
fn regenerate(start_config: &StartConfig) -> StartConfig {
    let persist = match &start_config.credentials {
        CredentialSource::Load {
            key_path,
            cert_path,
        }
        | CredentialSource::LoadOrGenerate {
            key_path,
            cert_path,
        } => Some((key_path.clone(), cert_path.clone())),
        CredentialSource::Generate { persist } => persist.clone(),
    };

    StartConfig {
        credentials: CredentialSource::Generate { persist },
        ..start_config.clone()
    }
}

/// Listens for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
