use std::path::PathBuf;
use thiserror::Error;

/// Represents the errors surfaced by the broker and its components.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The certificate primitive failed to produce a key/certificate pair.
    #[error("Credential generation failed: {0}")]
    GenerationError(String),

    /// A blob store read, write, copy or delete failed.
    ///
    /// Carries the path involved and the underlying I/O message.
    #[error("Storage error at {path:?}: {message}")]
    StorageError { path: PathBuf, message: String },

    /// An expected file does not exist.
    #[error("File not found: {0:?}")]
    NotFoundError(PathBuf),

    /// No port in the configured range could be bound within the probe budget.
    #[error("No free port in {min}..={max} after {attempts} probes")]
    PortExhaustionError { min: u16, max: u16, attempts: usize },

    /// Listening or TLS setup failed.
    #[error("Bind error: {0}")]
    BindError(String),

    /// Closing a previously bound listener failed.
    #[error("Teardown error: {0}")]
    TeardownError(String),

    /// The operation requires a bound listener and none is present.
    #[error("Listener is not bound")]
    NotBoundError,

    /// The credential store does not hold the material the operation needs.
    #[error("Missing credential: {0}")]
    MissingCredentialError(String),

    /// Represents an error in the broker configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Represents a general connection error.
    ///
    /// Raised when the WebSocket upgrade or a client-side handshake fails.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Represents an error related to channel message handling.
    #[error("Message error: {0}")]
    MessageError(#[from] crate::server::message::MessageError),

    /// Represents an error related to channel operations.
    #[error("Client error: {0}")]
    ClientError(#[from] crate::server::client::ClientError),
}

impl BrokerError {
    /// Wraps an I/O failure on `path` into a `StorageError`.
    pub fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BrokerError::StorageError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
