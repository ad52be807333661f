use std::{net::SocketAddr, path::PathBuf, time::Duration};

use config::Config;
use serde::Deserialize;

use crate::{
    secure::listener::ListenerOptions,
    server::{
        broker::{CredentialSource, StartConfig},
        middleware::ConnectionRateLimiter,
    },
    utils::error::BrokerError,
};

/// Configuration settings for the broker process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Host the secure listener binds to.
    pub host: String,
    /// Inclusive lower bound of the listening port range.
    pub min_port: u16,
    /// Inclusive upper bound of the listening port range.
    pub max_port: u16,
    /// Path of the broker's private key.
    pub key_path: PathBuf,
    /// Path of the broker's certificate.
    pub cert_path: PathBuf,
    /// Whether to generate (and persist) credentials when the files are absent.
    pub generate_credentials: bool,
    /// Certificates that client certificates are verified against.
    #[serde(default)]
    pub trusted_ca_paths: Vec<PathBuf>,
    /// The maximum number of simultaneous connections allowed.
    pub max_connections: usize,
    /// Connection attempts allowed per second and peer IP.
    pub connection_rate_limit: u32,
    /// Bound on the TLS and WebSocket handshakes.
    pub handshake_timeout_secs: u64,
    /// Port of the plain HTTP health listener, if any.
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl BrokerConfig {
    /// Loads the configuration from an optional file and the environment.
    ///
    /// The file is named by `BROKER_CONFIG_FILE`; environment variables are
    /// prefixed with `BROKER_` and override the file. `BROKER_TRUSTED_CA_PATHS`
    /// is a comma-separated list.
    ///
    /// # Errors
    /// Returns a `BrokerError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, BrokerError> {
        let file = std::env::var("BROKER_CONFIG_FILE").ok();
        Self::load(file.as_deref())
    }

    pub fn load(file: Option<&str>) -> Result<Self, BrokerError> {
        let mut builder = Config::builder()
            .set_default("host", "localhost")
            .and_then(|b| b.set_default("min_port", 45433))
            .and_then(|b| b.set_default("max_port", 45533))
            .and_then(|b| b.set_default("key_path", "./key"))
            .and_then(|b| b.set_default("cert_path", "./cert"))
            .and_then(|b| b.set_default("generate_credentials", true))
            .and_then(|b| b.set_default("max_connections", 1024))
            .and_then(|b| b.set_default("connection_rate_limit", 50))
            .and_then(|b| b.set_default("handshake_timeout_secs", 10))
            .map_err(|e| BrokerError::ConfigurationError(e.to_string()))?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix("BROKER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("trusted_ca_paths"),
            )
            .build()
            .map_err(|e| BrokerError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BrokerError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `BrokerError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(BrokerError::ConfigurationError(format!(
                "invalid port range {}..={}",
                self.min_port, self.max_port
            )));
        }

        if self.max_connections == 0 {
            return Err(BrokerError::ConfigurationError(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.max_connections > 10_000 {
            return Err(BrokerError::ConfigurationError(
                "max_connections cannot exceed 10,000".into(),
            ));
        }

        if self.connection_rate_limit == 0 {
            return Err(BrokerError::ConfigurationError(
                "connection_rate_limit must be greater than 0".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(BrokerError::ConfigurationError(
                "handshake_timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.generate_credentials {
            for path in [&self.key_path, &self.cert_path] {
                if !path.exists() {
                    return Err(BrokerError::ConfigurationError(format!(
                        "Credential file not found: {:?}",
                        path
                    )));
                }
            }
        }

        Ok(())
    }

    /// Builds the listener tuning from this configuration.
    pub fn listener_options(&self) -> Result<ListenerOptions, BrokerError> {
        Ok(ListenerOptions {
            min_port: self.min_port,
            max_port: self.max_port,
            max_connections: self.max_connections,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            rate_limiter: Some(ConnectionRateLimiter::new(self.connection_rate_limit)?),
        })
    }

    /// Builds the parameters of [`crate::ConnectionBroker::start`].
    pub fn start_config(&self) -> StartConfig {
        let credentials = if self.generate_credentials {
            CredentialSource::LoadOrGenerate {
                key_path: self.key_path.clone(),
                cert_path: self.cert_path.clone(),
            }
        } else {
            CredentialSource::Load {
                key_path: self.key_path.clone(),
                cert_path: self.cert_path.clone(),
            }
        };

        StartConfig {
            host: self.host.clone(),
            trusted_authority_paths: self.trusted_ca_paths.clone(),
            credentials,
        }
    }

    /// Address of the plain HTTP health listener, when enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_port
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}
