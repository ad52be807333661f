use std::{net::SocketAddr, sync::Arc};

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, instrument, warn};
use tungstenite::Message;

use crate::{
    secure::listener::ConnectionContext,
    server::{
        broker::BrokerShared,
        client::ClientChannel,
        events::{handler, CONNECTION_EVENT, DISCONNECT_EVENT},
        message::Envelope,
        middleware::validation::{validate_envelope, validate_frame_len},
    },
    utils::error::BrokerError,
};

/// Drives one authenticated connection from WebSocket upgrade to disconnect.
///
/// Admission (registry insert plus client middleware) completes before the
/// disconnect observer is attached, so a disconnect can never be processed
/// for a channel that is not registered yet.
///
/// # Errors
/// Returns `BrokerError::ConnectionError` if the WebSocket upgrade fails or times out.
#[instrument(skip(stream, peer_certificate, shared, ctx))]
pub(crate) async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    peer_certificate: Option<Vec<u8>>,
    shared: Arc<BrokerShared>,
    ctx: ConnectionContext,
) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionContext {
        server_events,
        mut shutdown,
        handshake_timeout,
    } = ctx;

    let upgrade = tokio_tungstenite::accept_async(stream);
    let ws_stream = tokio::time::timeout(handshake_timeout, upgrade)
        .await
        .map_err(|_| BrokerError::ConnectionError("WebSocket handshake timed out".into()))?
        .map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            BrokerError::ConnectionError(e.to_string())
        })?;

    let (writer, mut reader) = ws_stream.split();
    let channel = ClientChannel::new(addr, peer_certificate, writer);

    let admitted = shared
        .middleware
        .admit(&shared.registry, &channel, || !*shutdown.borrow());
    if !admitted {
        debug!("Listener shutting down, not admitting {}", addr);
        channel.close();
        return Ok(());
    }

    {
        let registry = shared.registry.clone();
        let id = channel.id();
        channel.once(
            DISCONNECT_EVENT,
            handler(move |_| {
                registry.remove_by_id(&id);
            }),
        );
    }

    shared.metrics.connections.inc();
    shared.metrics.connections_total.inc();
    info!("Channel {} admitted from {}", channel.id(), addr);
    server_events.emit(
        CONNECTION_EVENT,
        &json!({ "id": channel.id().to_string(), "peer": addr.to_string() }),
    );

    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break "server shutdown",
            frame = reader.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break "peer closed",
                Some(Ok(msg)) => {
                    if let Err(e) = process_message(msg, &channel, &shared) {
                        warn!("Rejected frame from {}: {}", addr, e);
                        if channel.emit("error", json!({ "message": e.to_string() })).is_ok() {
                            shared.metrics.events_sent.inc();
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!("Read error from {}: {}", addr, e);
                    break "transport error";
                }
            },
        }
    };

    channel.close();
    if channel.mark_disconnected(reason) {
        shared.metrics.connections.dec();
    }
    info!("Channel {} closed: {}", channel.id(), reason);
    Ok(())
}

/// Decodes, validates and dispatches one data frame to the channel's handlers.
fn process_message(
    msg: Message,
    channel: &ClientChannel,
    shared: &BrokerShared,
) -> Result<(), BrokerError> {
    match msg {
        Message::Text(_) | Message::Binary(_) => {
            validate_frame_len(msg.len())?;
            let envelope = Envelope::try_from(&msg)?;
            validate_envelope(&envelope)?;

            shared.metrics.events_received.inc();
            let handled = channel.dispatch(&envelope.event, &envelope.payload);
            debug!(
                "Event '{}' from {} reached {} handlers",
                envelope.event,
                channel.id(),
                handled
            );
            Ok(())
        }
        _ => {
            debug!("Unhandled frame type");
            Ok(())
        }
    }
}
