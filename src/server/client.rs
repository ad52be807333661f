use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt};
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, instrument};
use tungstenite::Message;
use uuid::Uuid;

use crate::server::{
    events::{EventHandlers, Handler, Payload, DISCONNECT_EVENT},
    message::Envelope,
};

/// Represents errors that may occur in channel operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message")]
    SendFailed,
    #[error("Channel is disconnected")]
    Disconnected,
}

struct ChannelInner {
    id: Uuid,
    addr: SocketAddr,
    peer_certificate: Option<Vec<u8>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    sender: mpsc::UnboundedSender<Message>,
    events: EventHandlers,
    disconnected: AtomicBool,
}

/// One authenticated, connected peer.
///
/// Cloning is cheap and every clone refers to the same channel; identity is
/// the [`Uuid`] returned by [`ClientChannel::id`].
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl ClientChannel {
    /// Creates a channel writing to the given WebSocket sink.
    ///
    /// Outbound frames are queued and written by a dedicated task, which ends
    /// when the sink fails or every clone of the channel has been dropped.
    #[instrument(skip(writer, peer_certificate))]
    pub fn new<S>(
        addr: SocketAddr,
        peer_certificate: Option<Vec<u8>>,
        writer: SplitSink<WebSocketStream<S>, Message>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = receiver.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = writer.send(msg).await {
                    debug!("Failed to write frame to {}: {}", addr, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        Self::with_sender(addr, peer_certificate, sender)
    }

    /// Creates a channel whose outbound frames go to `sender`.
    pub(crate) fn with_sender(
        addr: SocketAddr,
        peer_certificate: Option<Vec<u8>>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(ChannelInner {
                id: Uuid::new_v4(),
                addr,
                peer_certificate,
                connected_at: now,
                last_activity: Mutex::new(now),
                sender,
                events: EventHandlers::new(),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// DER bytes of the certificate the peer authenticated with.
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.inner.peer_certificate.as_deref()
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .inner
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .inner
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Attaches `handler` to `event` on this channel.
    pub fn on(&self, event: &str, handler: Handler) {
        self.inner.events.on(event, handler);
    }

    /// Attaches `handler` to the next occurrence of `event` on this channel.
    pub fn once(&self, event: &str, handler: Handler) {
        self.inner.events.once(event, handler);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    /// Runs the local handlers for an event received from the peer.
    pub(crate) fn dispatch(&self, event: &str, payload: &Payload) -> usize {
        self.touch();
        self.inner.events.emit(event, payload)
    }

    /// Sends an event to the peer.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Disconnected` once the channel has gone away and
    /// `ClientError::SendFailed` if the frame cannot be queued.
    pub fn emit(&self, event: &str, payload: Payload) -> Result<(), ClientError> {
        if self.is_disconnected() {
            return Err(ClientError::Disconnected);
        }
        let msg = Message::try_from(&Envelope::new(event, payload)).map_err(|e| {
            error!("Failed to encode event '{}': {}", event, e);
            ClientError::SendFailed
        })?;
        self.touch();
        self.inner.sender.send(msg).map_err(|e| {
            error!("Failed to queue message: {}", e);
            ClientError::SendFailed
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Asks the peer to close the connection.
    pub fn close(&self) {
        let _ = self.inner.sender.send(Message::Close(None));
    }

    /// Marks the channel as gone and fires its `disconnect` handlers.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub(crate) fn mark_disconnected(&self, reason: &str) -> bool {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Channel {} disconnected: {}", self.inner.id, reason);
        self.inner.events.emit(
            DISCONNECT_EVENT,
            &json!({ "id": self.inner.id.to_string(), "reason": reason }),
        );
        true
    }
}

struct Member {
    seq: u64,
    channel: ClientChannel,
}

/// The set of currently connected channels, keyed by channel id.
///
/// Membership is only changed by the broker; other callers read it through
/// [`ConnectionRegistry::snapshot`] and [`ConnectionRegistry::count`].
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    clients: Arc<DashMap<Uuid, Member>>,
    sequence: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `channel` unless its id is already present. Returns whether it
    /// was inserted.
    pub(crate) fn add(&self, channel: ClientChannel) -> bool {
        match self.clients.entry(channel.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                slot.insert(Member { seq, channel });
                true
            }
        }
    }

    /// Removes `channel` if present. Removing an absent channel is a no-op.
    pub(crate) fn remove(&self, channel: &ClientChannel) -> bool {
        self.remove_by_id(&channel.id())
    }

    pub(crate) fn remove_by_id(&self, id: &Uuid) -> bool {
        self.clients.remove(id).is_some()
    }

    pub(crate) fn clear(&self) {
        self.clients.clear();
    }

    pub fn get(&self, id: &Uuid) -> Option<ClientChannel> {
        self.clients.get(id).map(|entry| entry.channel.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.clients.contains_key(id)
    }

    /// Returns the current members in admission order.
    pub fn snapshot(&self) -> Vec<ClientChannel> {
        let mut members: Vec<(u64, ClientChannel)> = self
            .clients
            .iter()
            .map(|entry| (entry.seq, entry.channel.clone()))
            .collect();
        members.sort_by_key(|(seq, _)| *seq);
        members.into_iter().map(|(_, channel)| channel).collect()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Sends an event to every member and returns how many accepted it.
    #[instrument(skip(self, payload))]
    pub fn broadcast(&self, event: &str, payload: &Payload) -> usize {
        self.snapshot()
            .iter()
            .filter(|channel| match channel.emit(event, payload.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Broadcast to {} failed: {}", channel.id(), e);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
pub(crate) fn test_channel() -> (ClientChannel, mpsc::UnboundedReceiver<Message>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let addr = SocketAddr::from(([127, 0, 0, 1], 50000));
    (ClientChannel::with_sender(addr, None, sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::events::handler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn add_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (channel, _rx) = test_channel();

        assert!(registry.add(channel.clone()));
        assert!(!registry.add(channel.clone()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = test_channel();
        let (b, _rb) = test_channel();
        registry.add(a.clone());
        registry.add(b);

        assert!(registry.remove(&a));
        assert_eq!(registry.count(), 1);
        assert!(!registry.remove(&a));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn snapshot_preserves_admission_order_and_is_detached() {
        let registry = ConnectionRegistry::new();
        let channels: Vec<_> = (0..3).map(|_| test_channel()).collect();
        for (channel, _) in &channels {
            registry.add(channel.clone());
        }

        let snapshot = registry.snapshot();
        let ids: Vec<_> = snapshot.iter().map(ClientChannel::id).collect();
        let expected: Vec<_> = channels.iter().map(|(c, _)| c.id()).collect();
        assert_eq!(ids, expected);

        registry.remove(&channels[1].0);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn emit_queues_an_envelope() {
        let (channel, mut rx) = test_channel();
        channel.emit("greeting", json!({"hello": "world"})).unwrap();

        let frame = rx.try_recv().unwrap();
        let envelope = Envelope::try_from(&frame).unwrap();
        assert_eq!(envelope.event, "greeting");
    }

    #[test]
    fn disconnect_fires_once() {
        let (channel, _rx) = test_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        channel.on(
            DISCONNECT_EVENT,
            handler(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(channel.mark_disconnected("peer closed"));
        assert!(!channel.mark_disconnected("peer closed"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            channel.emit("late", json!(null)),
            Err(ClientError::Disconnected)
        ));
    }

    #[test]
    fn broadcast_skips_disconnected_channels() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = test_channel();
        let (b, _rb) = test_channel();
        registry.add(a);
        registry.add(b.clone());
        b.mark_disconnected("gone");

        assert_eq!(registry.broadcast("news", &json!("hi")), 1);
        assert!(ra.try_recv().is_ok());
    }
}
