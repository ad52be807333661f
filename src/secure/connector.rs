use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, instrument};

use crate::{
    secure::{credentials::CredentialStore, tls},
    utils::BrokerError,
};

/// A WebSocket session over a mutually authenticated TLS stream.
pub type SecureSocket = WebSocketStream<TlsStream<TcpStream>>;

/// Connects to a broker, authenticating with a client certificate.
///
/// The credential store must hold the client's own key pair and, as trusted
/// authorities, the certificate(s) the broker presents.
#[derive(Debug)]
pub struct SecureConnector {
    credentials: CredentialStore,
}

impl SecureConnector {
    pub fn new(credentials: CredentialStore) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialStore {
        &mut self.credentials
    }

    /// Opens a TLS connection to `addr`, verifies the broker as `server_name`,
    /// and performs the WebSocket upgrade.
    ///
    /// # Errors
    /// * `BrokerError::MissingCredentialError` if key, certificate or authorities are absent.
    /// * `BrokerError::ConnectionError` if the TCP, TLS or WebSocket handshake fails.
    #[instrument(skip(self))]
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<SecureSocket, BrokerError> {
        let config = tls::client_config(&self.credentials.credential())?;
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| BrokerError::ConfigurationError(format!("{}: {}", server_name, e)))?;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;
        let tls_stream = TlsConnector::from(Arc::new(config))
            .connect(name, tcp)
            .await
            .map_err(|e| BrokerError::ConnectionError(format!("TLS handshake failed: {}", e)))?;

        let url = format!("wss://{}:{}/", server_name, addr.port());
        let (socket, _) = tokio_tungstenite::client_async(url, tls_stream)
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        debug!("Connected to {}", addr);
        Ok(socket)
    }
}
