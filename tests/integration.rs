mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::*;
use futures_util::{SinkExt, StreamExt};
use mtls_broker::{
    secure::{tls, ListenerState},
    server::{events::handler, Envelope},
};
use rustls::{ClientConfig, RootCertStore};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tungstenite::Message;

fn frame(event: &str, payload: serde_json::Value) -> Message {
    Message::try_from(&Envelope::new(event, payload)).unwrap()
}

fn counter() -> (Arc<AtomicUsize>, mtls_broker::server::Handler) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (
        count,
        handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

#[tokio::test]
async fn binds_in_range_and_tracks_connect_and_disconnect() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-a").await;
    let mut test = start_broker(45433, 45533, &[&client]).await;

    let port = test.broker.address().unwrap().port();
    assert!((45433..=45533).contains(&port));

    let mut socket = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 1).await);

    let channel = &test.broker.registry().snapshot()[0];
    let expected = tls::parse_certificates(&client.material.certificate).unwrap();
    assert_eq!(channel.peer_certificate(), Some(expected[0].0.as_slice()));

    socket.close(None).await.unwrap();
    assert!(wait_for(|| test.broker.registry().snapshot().is_empty()).await);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn disconnecting_one_of_three_leaves_two() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-b").await;
    let mut test = start_broker(47200, 47300, &[&client]).await;

    let mut sockets = Vec::new();
    for _ in 0..3 {
        sockets.push(connect(&test.broker, &client).await);
    }
    assert!(wait_for(|| test.broker.registry().count() == 3).await);

    let mut leaving = sockets.remove(1);
    leaving.close(None).await.unwrap();
    assert!(wait_for(|| test.broker.registry().count() == 2).await);

    // Give late duplicate notifications a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(test.broker.registry().count(), 2);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn client_middleware_reaches_future_and_existing_channels() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-c").await;
    let mut test = start_broker(47400, 47500, &[&client]).await;

    let (before, early) = counter();
    test.broker.add_client_middleware("chat", early);

    let mut socket = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 1).await);

    let (after, late) = counter();
    test.broker.add_client_middleware("chat", late);

    socket.send(frame("chat", json!({"text": "hi"}))).await.unwrap();
    assert!(wait_for(|| before.load(Ordering::SeqCst) == 1).await);
    assert!(wait_for(|| after.load(Ordering::SeqCst) == 1).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn client_without_certificate_never_reaches_registry() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-d").await;
    let mut test = start_broker(47600, 47700, &[&client]).await;

    let (admissions, on_connection) = counter();
    test.broker
        .add_server_middleware("connection", on_connection)
        .unwrap();

    let mut roots = RootCertStore::empty();
    for cert in tls::parse_certificates(&server_certificate(&test.broker)).unwrap() {
        roots.add(&cert).unwrap();
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let addr = test.broker.address().unwrap();
    let outcome = async {
        let tcp = TcpStream::connect(addr).await?;
        let name = rustls::ServerName::try_from(SERVER_NAME).unwrap();
        let tls_stream = TlsConnector::from(Arc::new(config)).connect(name, tcp).await?;
        let url = format!("wss://{}:{}/", SERVER_NAME, addr.port());
        tokio_tungstenite::client_async(url, tls_stream)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
    .await;
    assert!(outcome.is_err());

    let failures = test.broker.metrics().tls_handshake_failures.clone();
    assert!(wait_for(|| failures.get() >= 1).await);
    assert_eq!(test.broker.registry().count(), 0);
    assert_eq!(admissions.load(Ordering::SeqCst), 0);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn untrusted_certificate_is_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let trusted = client_identity(scratch.path(), "trusted").await;
    let stranger = client_identity(scratch.path(), "stranger").await;
    let mut test = start_broker(47800, 47900, &[&trusted]).await;

    let addr = test.broker.address().unwrap();
    let result = connector(&stranger, &server_certificate(&test.broker))
        .await
        .connect(addr, SERVER_NAME)
        .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(test.broker.registry().count(), 0);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_channel() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-e").await;
    let mut test = start_broker(48000, 48100, &[&client]).await;

    let mut first = connect(&test.broker, &client).await;
    let mut second = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 2).await);

    assert_eq!(test.broker.broadcast("news", &json!({"n": 1})), 2);

    for socket in [&mut first, &mut second] {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let envelope = Envelope::try_from(&msg).unwrap();
        assert_eq!(envelope, Envelope::new("news", json!({"n": 1})));
    }

    let target = test.broker.registry().snapshot()[0].id();
    test.broker.send_to(&target, "direct", json!("hello")).unwrap();
    let mut received = 0;
    for socket in [&mut first, &mut second] {
        let next = tokio::time::timeout(Duration::from_millis(500), socket.next()).await;
        if let Ok(Some(Ok(msg))) = next {
            assert_eq!(Envelope::try_from(&msg).unwrap().event, "direct");
            received += 1;
        }
    }
    assert_eq!(received, 1);

    test.broker.stop().await.unwrap();
}

#[tokio::test]
async fn restart_disconnects_channels_and_rebinds() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-f").await;
    let mut test = start_broker(48200, 48300, &[&client]).await;

    let (disconnects, on_disconnect) = counter();
    test.broker.add_client_middleware("disconnect", on_disconnect);

    let mut socket = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 1).await);
    let old_cert = server_certificate(&test.broker);

    let config = test.config.clone();
    let handle = test.broker.restart(&config).await.unwrap();
    assert_eq!(handle.state, ListenerState::Bound);
    assert!((48200..=48300).contains(&handle.port));
    assert_ne!(server_certificate(&test.broker), old_cert);

    // The old session is torn down by the restart.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(wait_for(|| disconnects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(test.broker.registry().count(), 0);

    // New clients are admitted with the regenerated server certificate.
    let _fresh = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 1).await);

    test.broker.stop().await.unwrap();
    assert_eq!(test.broker.listener_handle().state, ListenerState::Closed);
}

#[tokio::test]
async fn reserved_events_from_peers_are_ignored() {
    let scratch = tempfile::tempdir().unwrap();
    let client = client_identity(scratch.path(), "client-g").await;
    let mut test = start_broker(48400, 48500, &[&client]).await;

    let mut socket = connect(&test.broker, &client).await;
    assert!(wait_for(|| test.broker.registry().count() == 1).await);

    socket.send(frame("disconnect", json!(null))).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(Envelope::try_from(&reply).unwrap().event, "error");
    assert_eq!(test.broker.registry().count(), 1);

    test.broker.stop().await.unwrap();
}
