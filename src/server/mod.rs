// src/server/mod.rs
pub mod broker;
pub mod client;
pub mod events;
pub mod handler;
pub mod health;
pub mod message;
pub mod middleware;

// Re-export public components
pub use broker::{ConnectionBroker, CredentialSource, StartConfig};
pub use client::{ClientChannel, ConnectionRegistry};
pub use events::{handler, EventHandlers, Handler, Payload};
pub use health::HealthMetrics;
pub use message::Envelope;
pub use middleware::{ConnectionRateLimiter, MiddlewareEntry, MiddlewareRegistry};
