//! PEM parsing and rustls configuration for both ends of a channel.

use std::sync::Arc;

use rustls::{
    server::AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, RootCertStore,
    ServerConfig,
};
use rustls_pemfile::{read_all, Item};
use tracing::warn;

use crate::{secure::credentials::Credential, utils::BrokerError};

/// Parses every certificate in a PEM bundle.
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<Certificate>, String> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .map_err(|e| format!("Cert parse error: {}", e))?;
    if certs.is_empty() {
        return Err("no certificate found in PEM data".into());
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Parses the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM bundle.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKey, String> {
    let items = read_all(&mut &pem[..]).map_err(|e| format!("Key parse error: {}", e))?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| "no private key found in PEM data".to_string())
}

fn root_store(authorities: &[Vec<u8>]) -> Result<RootCertStore, String> {
    let mut roots = RootCertStore::empty();
    for pem in authorities {
        for cert in parse_certificates(pem)? {
            roots
                .add(&cert)
                .map_err(|e| format!("Trusted authority rejected: {}", e))?;
        }
    }
    Ok(roots)
}

/// Builds a server config that presents the credential's certificate and
/// requires every peer to present a certificate signed by one of the
/// credential's trusted authorities.
pub fn server_config(credential: &Credential) -> Result<ServerConfig, BrokerError> {
    let material = credential.key_material().ok_or_else(|| {
        BrokerError::MissingCredentialError("listener needs a key and certificate".into())
    })?;

    let certs = parse_certificates(&material.certificate).map_err(BrokerError::BindError)?;
    let key = parse_private_key(&material.private_key).map_err(BrokerError::BindError)?;

    let roots = root_store(credential.trusted_authorities()).map_err(BrokerError::BindError)?;
    if roots.is_empty() {
        warn!("No trusted authorities loaded; every client certificate will be rejected");
    }

    ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::BindError(format!("TLS config error: {}", e)))
}

/// Builds a client config that authenticates with the credential's key pair and
/// trusts only the credential's authorities.
pub fn client_config(credential: &Credential) -> Result<ClientConfig, BrokerError> {
    let material = credential.key_material().ok_or_else(|| {
        BrokerError::MissingCredentialError("client needs a key and certificate".into())
    })?;
    if credential.trusted_authorities().is_empty() {
        return Err(BrokerError::MissingCredentialError(
            "client needs at least one trusted authority".into(),
        ));
    }

    let certs =
        parse_certificates(&material.certificate).map_err(BrokerError::ConfigurationError)?;
    let key = parse_private_key(&material.private_key).map_err(BrokerError::ConfigurationError)?;
    let roots =
        root_store(credential.trusted_authorities()).map_err(BrokerError::ConfigurationError)?;

    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| BrokerError::ConfigurationError(format!("TLS config error: {}", e)))
}

/// Wraps [`server_config`] into an acceptor.
pub fn acceptor(credential: &Credential) -> Result<tokio_rustls::TlsAcceptor, BrokerError> {
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config(
        credential,
    )?)))
}
