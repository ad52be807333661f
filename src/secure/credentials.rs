use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
use tracing::{debug, info, instrument, warn};

use crate::{storage::BlobStore, utils::BrokerError};

/// A private key together with the certificate it signs.
///
/// Both halves are PEM-encoded bytes. Keeping them in one value is what makes
/// "key without certificate" unrepresentable.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &"<redacted>")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .finish()
    }
}

/// Read-only copy of everything a TLS endpoint needs to authenticate.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    material: Option<KeyMaterial>,
    trusted_authorities: Vec<Vec<u8>>,
}

impl Credential {
    pub fn new(material: Option<KeyMaterial>, trusted_authorities: Vec<Vec<u8>>) -> Self {
        Self {
            material,
            trusted_authorities,
        }
    }

    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.material.as_ref()
    }

    pub fn trusted_authorities(&self) -> &[Vec<u8>] {
        &self.trusted_authorities
    }
}

/// Paths a credential pair was persisted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

/// Produces self-signed key/certificate pairs.
pub trait CertificateGenerator: Send + Sync {
    fn generate_self_signed(&self) -> Result<KeyMaterial, BrokerError>;
}

/// [`CertificateGenerator`] backed by `rcgen`.
#[derive(Debug, Clone)]
pub struct RcgenGenerator {
    common_name: String,
    subject_alt_names: Vec<String>,
}

impl RcgenGenerator {
    pub fn new(common_name: impl Into<String>, subject_alt_names: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            subject_alt_names,
        }
    }
}

impl Default for RcgenGenerator {
    fn default() -> Self {
        Self::new(
            "mtls-broker",
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
        )
    }
}

impl CertificateGenerator for RcgenGenerator {
    fn generate_self_signed(&self) -> Result<KeyMaterial, BrokerError> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = self
            .subject_alt_names
            .iter()
            .map(|name| match name.parse() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(name.clone()),
            })
            .collect();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.common_name.as_str());

        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| BrokerError::GenerationError(e.to_string()))?;
        let certificate = cert
            .serialize_pem()
            .map_err(|e| BrokerError::GenerationError(e.to_string()))?;

        Ok(KeyMaterial {
            private_key: cert.serialize_private_key_pem().into_bytes(),
            certificate: certificate.into_bytes(),
        })
    }
}

/// Owns one endpoint's key, certificate and trusted authorities.
///
/// Material is loaded from or persisted to a [`BlobStore`]; the store remembers
/// where it last persisted or loaded from so that [`CredentialStore::release`]
/// can remove those files.
pub struct CredentialStore {
    blobs: Arc<dyn BlobStore>,
    generator: Arc<dyn CertificateGenerator>,
    material: Option<KeyMaterial>,
    trusted_authorities: Vec<Vec<u8>>,
    location: Option<PersistedPaths>,
}

impl CredentialStore {
    pub fn new(blobs: Arc<dyn BlobStore>, generator: Arc<dyn CertificateGenerator>) -> Self {
        Self {
            blobs,
            generator,
            material: None,
            trusted_authorities: Vec::new(),
            location: None,
        }
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.material.as_ref()
    }

    pub fn trusted_authorities(&self) -> &[Vec<u8>] {
        &self.trusted_authorities
    }

    pub fn location(&self) -> Option<&PersistedPaths> {
        self.location.as_ref()
    }

    /// Returns a copy of the stored credential.
    pub fn credential(&self) -> Credential {
        Credential::new(self.material.clone(), self.trusted_authorities.clone())
    }

    /// Produces fresh self-signed material without touching the stored state.
    ///
    /// Key generation runs on the blocking pool.
    pub async fn generate(&self) -> Result<KeyMaterial, BrokerError> {
        let generator = self.generator.clone();
        let material = tokio::task::spawn_blocking(move || generator.generate_self_signed())
            .await
            .map_err(|e| BrokerError::GenerationError(format!("generator task failed: {}", e)))??;
        debug!("Generated self-signed credential");
        Ok(material)
    }

    /// Replaces the in-memory key and certificate. Trusted authorities are kept.
    pub fn adopt(&mut self, material: KeyMaterial) {
        self.material = Some(material);
    }

    /// Generates fresh material and adopts it.
    pub async fn update(&mut self) -> Result<&KeyMaterial, BrokerError> {
        let material = self.generate().await?;
        Ok(&*self.material.insert(material))
    }

    /// Writes the stored key and certificate and records the paths as canonical.
    #[instrument(skip(self))]
    pub async fn persist(
        &mut self,
        key_path: &Path,
        cert_path: &Path,
    ) -> Result<PersistedPaths, BrokerError> {
        let material = self.material.as_ref().ok_or_else(|| {
            BrokerError::MissingCredentialError("no key material to persist".into())
        })?;

        let (key, cert) = tokio::join!(
            self.blobs.save(key_path, &material.private_key),
            self.blobs.save(cert_path, &material.certificate),
        );
        let paths = PersistedPaths {
            key_path: key?,
            cert_path: cert?,
        };

        info!("Persisted credential to {:?} and {:?}", paths.key_path, paths.cert_path);
        self.location = Some(paths.clone());
        Ok(paths)
    }

    /// Reads key and certificate from disk into the store.
    ///
    /// The stored state is only replaced once both reads succeeded.
    #[instrument(skip(self))]
    pub async fn load(&mut self, key_path: &Path, cert_path: &Path) -> Result<(), BrokerError> {
        for path in [key_path, cert_path] {
            if !self.blobs.exists(path).await {
                return Err(BrokerError::NotFoundError(path.to_path_buf()));
            }
        }

        let (key, cert) = tokio::join!(self.blobs.read(key_path), self.blobs.read(cert_path));
        self.material = Some(KeyMaterial {
            private_key: key?,
            certificate: cert?,
        });
        self.location = Some(PersistedPaths {
            key_path: key_path.to_path_buf(),
            cert_path: cert_path.to_path_buf(),
        });

        info!("Loaded credential from {:?} and {:?}", key_path, cert_path);
        Ok(())
    }

    /// Replaces the trusted authorities with the contents of `paths`, in order.
    ///
    /// On failure the previously loaded authorities are left untouched.
    #[instrument(skip(self, paths))]
    pub async fn load_trusted_authorities<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
    ) -> Result<(), BrokerError> {
        let mut authorities = Vec::with_capacity(paths.len());
        for path in paths {
            authorities.push(self.blobs.read(path.as_ref()).await?);
        }

        debug!("Loaded {} trusted authorities", authorities.len());
        self.trusted_authorities = authorities;
        Ok(())
    }

    /// Deletes the persisted files and clears all stored material.
    ///
    /// Files that are already gone are not an error.
    #[instrument(skip(self))]
    pub async fn release(&mut self) -> Result<(), BrokerError> {
        if let Some(paths) = &self.location {
            for path in [&paths.key_path, &paths.cert_path] {
                match self.blobs.delete(path).await {
                    Ok(()) | Err(BrokerError::NotFoundError(_)) => {}
                    Err(e) => {
                        warn!("Failed to delete credential file {:?}: {}", path, e);
                        return Err(e);
                    }
                }
            }
        }

        self.material = None;
        self.trusted_authorities.clear();
        self.location = None;
        Ok(())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("material", &self.material)
            .field("trusted_authorities", &self.trusted_authorities.len())
            .field("location", &self.location)
            .finish()
    }
}
