use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    secure::{
        credentials::{CredentialStore, RcgenGenerator},
        listener::{
            ConnectionContext, ConnectionHandler, ListenerHandle, ListenerOptions, ListenerState,
            SecureListener,
        },
    },
    server::{
        client::{ClientError, ConnectionRegistry},
        events::{handler, Handler, Payload, TLS_CLIENT_ERROR_EVENT},
        handler::handle_connection,
        health::HealthMetrics,
        middleware::MiddlewareRegistry,
    },
    storage::FsBlobStore,
    utils::BrokerError,
};

/// Where [`ConnectionBroker::start`] takes its key and certificate from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Generate fresh material, optionally persisting it to `(key, cert)`.
    Generate { persist: Option<(PathBuf, PathBuf)> },
    /// Load existing material; absent files are an error.
    Load { key_path: PathBuf, cert_path: PathBuf },
    /// Load when both files exist, otherwise generate and persist there.
    LoadOrGenerate { key_path: PathBuf, cert_path: PathBuf },
}

/// Parameters of one [`ConnectionBroker::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartConfig {
    pub host: String,
    pub trusted_authority_paths: Vec<PathBuf>,
    pub credentials: CredentialSource,
}

/// State shared between the broker and its connection tasks.
pub(crate) struct BrokerShared {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) middleware: MiddlewareRegistry,
    pub(crate) metrics: HealthMetrics,
}

/// Mutual-TLS connection broker.
///
/// Owns its credentials, its listener, the registry of connected channels
/// and the middleware applied to them.
pub struct ConnectionBroker {
    credentials: CredentialStore,
    listener: SecureListener,
    shared: Arc<BrokerShared>,
}

impl ConnectionBroker {
    /// Creates a broker persisting credentials on the filesystem and
    /// generating them with `rcgen`.
    pub fn new(options: ListenerOptions) -> Self {
        let credentials = CredentialStore::new(
            Arc::new(FsBlobStore::new()),
            Arc::new(RcgenGenerator::default()),
        );
        Self::with_credential_store(options, credentials)
    }

    pub fn with_credential_store(options: ListenerOptions, credentials: CredentialStore) -> Self {
        let shared = Arc::new(BrokerShared {
            registry: ConnectionRegistry::new(),
            middleware: MiddlewareRegistry::new(),
            metrics: HealthMetrics::new(),
        });

        let listener = SecureListener::new(options);
        let metrics = shared.metrics.clone();
        listener.events().on(
            TLS_CLIENT_ERROR_EVENT,
            handler(move |_| metrics.tls_handshake_failures.inc()),
        );

        Self {
            credentials,
            listener,
            shared,
        }
    }

    /// Prepares credentials and binds the listener.
    ///
    /// On failure the broker is left unbound with an empty registry and
    /// `start` may be retried.
    #[instrument(skip(self, config), fields(host = %config.host))]
    pub async fn start(&mut self, config: &StartConfig) -> Result<ListenerHandle, BrokerError> {
        match self.try_start(config).await {
            Ok(handle) => {
                info!("Broker listening on {}:{}", handle.host, handle.port);
                Ok(handle)
            }
            Err(e) => {
                warn!("Broker failed to start: {}", e);
                if self.listener.state() == ListenerState::Bound {
                    if let Err(close_err) = self.listener.close().await {
                        warn!("Cleanup after failed start: {}", close_err);
                    }
                }
                self.shared.middleware.clear_registry(&self.shared.registry);
                Err(e)
            }
        }
    }

    async fn try_start(&mut self, config: &StartConfig) -> Result<ListenerHandle, BrokerError> {
        self.prepare_credentials(&config.credentials).await?;
        self.credentials
            .load_trusted_authorities(&config.trusted_authority_paths)
            .await?;

        let credential = self.credentials.credential();
        let on_connection = self.connection_handler();
        self.listener
            .bind(&config.host, &credential, on_connection)
            .await
    }

    async fn prepare_credentials(&mut self, source: &CredentialSource) -> Result<(), BrokerError> {
        match source {
            CredentialSource::Generate { persist } => {
                self.credentials.update().await?;
                if let Some((key_path, cert_path)) = persist {
                    self.credentials.persist(key_path, cert_path).await?;
                }
            }
            CredentialSource::Load {
                key_path,
                cert_path,
            } => {
                self.credentials.load(key_path, cert_path).await?;
            }
            CredentialSource::LoadOrGenerate {
                key_path,
                cert_path,
            } => {
                let blobs = self.credentials.blob_store().clone();
                if blobs.exists(key_path).await && blobs.exists(cert_path).await {
                    self.credentials.load(key_path, cert_path).await?;
                } else {
                    info!("No credential at {:?}, generating one", key_path);
                    self.credentials.update().await?;
                    self.credentials.persist(key_path, cert_path).await?;
                }
            }
        }
        Ok(())
    }

    fn connection_handler(&self) -> ConnectionHandler {
        let shared = self.shared.clone();
        Arc::new(
            move |stream: TlsStream<TcpStream>,
                  addr: SocketAddr,
                  ctx: ConnectionContext|
                  -> BoxFuture<'static, ()> {
                let shared = shared.clone();
                Box::pin(async move {
                    let peer_certificate = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|chain| chain.first())
                        .map(|cert| cert.0.clone());

                    let result =
                        handle_connection(stream, addr, peer_certificate, shared, ctx).await;
                    if let Err(e) = result {
                        warn!("Connection from {} ended with error: {}", addr, e);
                    }
                })
            },
        )
    }

    /// Closes the listener, which disconnects every open channel, and resets
    /// the registry for a later `start`.
    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        let result = self.listener.close().await;
        self.shared.middleware.clear_registry(&self.shared.registry);
        info!("Broker stopped");
        result
    }

    /// `stop` followed by `start`. A failed teardown is logged and does not
    /// prevent the new start.
    pub async fn restart(&mut self, config: &StartConfig) -> Result<ListenerHandle, BrokerError> {
        if let Err(e) = self.stop().await {
            warn!("Teardown before restart failed: {}", e);
        }
        self.start(config).await
    }

    /// Attaches `handler` to the live listener for `event`.
    pub fn add_server_middleware(&self, event: &str, handler: Handler) -> Result<(), BrokerError> {
        self.shared
            .middleware
            .add_server_middleware(&self.listener, event, handler)
    }

    /// Attaches `handler` to every current and future channel for `event`.
    pub fn add_client_middleware(&self, event: &str, handler: Handler) {
        self.shared
            .middleware
            .add_client_middleware(&self.shared.registry, event, handler);
    }

    /// Sends an event to every connected channel; returns how many accepted it.
    pub fn broadcast(&self, event: &str, payload: &Payload) -> usize {
        let sent = self.shared.registry.broadcast(event, payload);
        self.shared.metrics.events_sent.inc_by(sent as u64);
        sent
    }

    /// Sends an event to the channel with the given id.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ClientError` if no such channel is connected or
    /// the frame cannot be queued.
    pub fn send_to(&self, id: &Uuid, event: &str, payload: Payload) -> Result<(), BrokerError> {
        let channel = self
            .shared
            .registry
            .get(id)
            .ok_or(ClientError::Disconnected)?;
        channel.emit(event, payload)?;
        self.shared.metrics.events_sent.inc();
        Ok(())
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn middleware(&self) -> &MiddlewareRegistry {
        &self.shared.middleware
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.shared.metrics
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialStore {
        &mut self.credentials
    }

    pub fn listener_handle(&self) -> ListenerHandle {
        self.listener.handle()
    }

    pub fn address(&self) -> Result<SocketAddr, BrokerError> {
        self.listener.address()
    }
}
