use serde::{Deserialize, Serialize};
use thiserror::Error;
use tungstenite::Message;

use crate::server::events::Payload;

/// Represents the errors that can occur when decoding or validating frames.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The frame is not a well-formed envelope.
    #[error("Invalid message format")]
    InvalidFormat,

    /// Envelope (de)serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The frame exceeds the allowed size.
    #[error("Message too long")]
    MessageTooLong,

    /// The event name is empty or too long.
    #[error("Invalid event name: {0:?}")]
    InvalidEventName(String),

    /// Peers may not emit events the broker raises itself.
    #[error("Reserved event name: {0}")]
    ReservedEvent(String),
}

/// A named event and its payload, carried as one JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Payload) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Decodes a data frame into an envelope. Control frames are not envelopes.
impl TryFrom<&Message> for Envelope {
    type Error = MessageError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        match msg {
            Message::Text(text) => serde_json::from_str(text)
                .map_err(|e| MessageError::SerializationError(e.to_string())),
            Message::Binary(data) => serde_json::from_slice(data)
                .map_err(|e| MessageError::SerializationError(e.to_string())),
            _ => Err(MessageError::InvalidFormat),
        }
    }
}

/// Encodes an envelope into a text frame.
impl TryFrom<&Envelope> for Message {
    type Error = MessageError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        serde_json::to_string(envelope)
            .map(Message::Text)
            .map_err(|e| MessageError::SerializationError(e.to_string()))
    }
}
