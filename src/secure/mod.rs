// src/secure/mod.rs
pub mod connector;
pub mod credentials;
pub mod listener;
pub mod port;
pub mod tls;

pub use connector::{SecureConnector, SecureSocket};
pub use credentials::{
    CertificateGenerator, Credential, CredentialStore, KeyMaterial, PersistedPaths, RcgenGenerator,
};
pub use listener::{ListenerHandle, ListenerOptions, ListenerState, SecureListener};
pub use port::PortAllocator;
