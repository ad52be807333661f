//! Connects to a running broker with a client certificate and sends one event.
//!
//! Environment:
//! - `BROKER_URL` (default `wss://localhost:45433`)
//! - `CLIENT_KEY_PATH`, `CLIENT_CERT_PATH`: the client's identity
//! - `BROKER_CA_PATH`: certificate the broker's certificate is checked against

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use mtls_broker::{
    secure::{CredentialStore, RcgenGenerator, SecureConnector},
    server::Envelope,
    storage::FsBlobStore,
};
use serde_json::json;
use tungstenite::Message;
use url::Url;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let url = Url::parse(&env_or("BROKER_URL", "wss://localhost:45433"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("BROKER_URL has no host"))?
        .to_string();
    let port = url.port().unwrap_or(45433);
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} did not resolve", host))?;

    let mut store = CredentialStore::new(
        Arc::new(FsBlobStore::new()),
        Arc::new(RcgenGenerator::default()),
    );
    store
        .load(
            env_or("CLIENT_KEY_PATH", "./client.key").as_ref(),
            env_or("CLIENT_CERT_PATH", "./client.cert").as_ref(),
        )
        .await?;
    store
        .load_trusted_authorities(&[env_or("BROKER_CA_PATH", "./cert")])
        .await?;

    let mut socket = SecureConnector::new(store).connect(addr, &host).await?;
    let envelope = Envelope::new("message", json!({ "text": "Hello, broker!" }));
    socket.send(Message::try_from(&envelope)?).await?;
    println!("Event sent to {}", url);

    socket.close(None).await?;
    while let Some(frame) = socket.next().await {
        if frame.is_err() {
            break;
        }
    }
    Ok(())
}
