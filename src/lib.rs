//! # Mutual-TLS connection broker
//!
//! Terminates TLS connections authenticated by client certificates, keeps a
//! registry of the connected channels, and attaches event middleware to every
//! current and future channel.
//!
//! - [`secure`]: credentials, port allocation, TLS listener and client connector
//! - [`server`]: channels, registry, middleware and the [`ConnectionBroker`]
//! - [`storage`]: the blob store credentials are persisted through

pub mod config;
pub mod secure;
pub mod server;
pub mod storage;
pub mod utils;

pub use server::{ConnectionBroker, CredentialSource, StartConfig};
pub use utils::BrokerError;
