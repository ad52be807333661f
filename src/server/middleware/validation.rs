use crate::server::events::{CONNECTION_EVENT, DISCONNECT_EVENT};
use crate::server::message::{Envelope, MessageError};

/// Largest accepted inbound frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Longest accepted event name, in bytes.
pub const MAX_EVENT_NAME_BYTES: usize = 128;

/// Rejects frames larger than [`MAX_FRAME_BYTES`].
pub fn validate_frame_len(len: usize) -> Result<(), MessageError> {
    if len > MAX_FRAME_BYTES {
        return Err(MessageError::MessageTooLong);
    }
    Ok(())
}

/// Validates an inbound envelope before it is dispatched to channel handlers.
///
/// # Returns
///
/// * `Ok(())` if the event name is usable by a peer.
/// * `Err(MessageError::InvalidEventName)` if it is empty or too long.
/// * `Err(MessageError::ReservedEvent)` if it names a broker-raised event.
pub fn validate_envelope(envelope: &Envelope) -> Result<(), MessageError> {
    let event = envelope.event.as_str();
    if event.is_empty() || event.len() > MAX_EVENT_NAME_BYTES {
        return Err(MessageError::InvalidEventName(event.to_string()));
    }
    if event == DISCONNECT_EVENT || event == CONNECTION_EVENT {
        return Err(MessageError::ReservedEvent(event.to_string()));
    }
    Ok(())
}
