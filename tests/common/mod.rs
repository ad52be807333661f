#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use mtls_broker::{
    secure::{
        CertificateGenerator, CredentialStore, KeyMaterial, ListenerOptions, RcgenGenerator,
        SecureConnector, SecureSocket,
    },
    storage::{BlobStore, FsBlobStore, MemoryBlobStore},
    ConnectionBroker, CredentialSource, StartConfig,
};
use tempfile::TempDir;

pub const SERVER_NAME: &str = "localhost";

/// A started broker plus the scratch directory holding its files.
pub struct TestBroker {
    pub broker: ConnectionBroker,
    pub dir: TempDir,
    pub config: StartConfig,
}

/// A client identity whose certificate the broker may or may not trust.
pub struct TestClient {
    pub material: KeyMaterial,
    pub cert_path: PathBuf,
}

pub async fn client_identity(dir: &Path, name: &str) -> TestClient {
    let material = RcgenGenerator::new(name, vec![name.to_string()])
        .generate_self_signed()
        .unwrap();
    let cert_path = dir.join(format!("{}.cert", name));
    FsBlobStore::new()
        .save(&cert_path, &material.certificate)
        .await
        .unwrap();
    TestClient {
        material,
        cert_path,
    }
}

/// Starts a broker on 127.0.0.1 that trusts the given client certificates.
pub async fn start_broker(min_port: u16, max_port: u16, trusted: &[&TestClient]) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let mut broker = ConnectionBroker::new(ListenerOptions {
        min_port,
        max_port,
        handshake_timeout: Duration::from_secs(5),
        ..Default::default()
    });

    let config = StartConfig {
        host: "127.0.0.1".into(),
        trusted_authority_paths: trusted.iter().map(|c| c.cert_path.clone()).collect(),
        credentials: CredentialSource::Generate {
            persist: Some((dir.path().join("key"), dir.path().join("cert"))),
        },
    };
    broker.start(&config).await.unwrap();

    TestBroker {
        broker,
        dir,
        config,
    }
}

pub fn server_certificate(broker: &ConnectionBroker) -> Vec<u8> {
    broker
        .credentials()
        .key_material()
        .expect("broker holds credentials")
        .certificate
        .clone()
}

/// Builds a connector authenticating as `client` and trusting `server_cert`.
pub async fn connector(client: &TestClient, server_cert: &[u8]) -> SecureConnector {
    let blobs = MemoryBlobStore::new();
    blobs
        .save(Path::new("/server.cert"), server_cert)
        .await
        .unwrap();

    let mut store = CredentialStore::new(Arc::new(blobs), Arc::new(RcgenGenerator::default()));
    store.adopt(client.material.clone());
    store
        .load_trusted_authorities(&["/server.cert"])
        .await
        .unwrap();
    SecureConnector::new(store)
}

pub async fn connect(broker: &ConnectionBroker, client: &TestClient) -> SecureSocket {
    let addr: SocketAddr = broker.address().unwrap();
    connector(client, &server_certificate(broker))
        .await
        .connect(addr, SERVER_NAME)
        .await
        .unwrap()
}

/// Polls `condition` until it holds or a few seconds have passed.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
