use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    secure::{credentials::Credential, port::PortAllocator, tls},
    server::{
        events::{
            EventHandlers, Handler, CLOSE_EVENT, ERROR_EVENT, LISTENING_EVENT,
            SECURE_CONNECTION_EVENT, TLS_CLIENT_ERROR_EVENT,
        },
        middleware::ConnectionRateLimiter,
    },
    utils::BrokerError,
};

/// Lifecycle of a [`SecureListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Closed,
}

/// Where a listener is (or was last) bound and what state it is in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub host: String,
    pub port: u16,
    pub state: ListenerState,
}

/// Tuning for a [`SecureListener`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Inclusive lower bound of the listening port range.
    pub min_port: u16,
    /// Inclusive upper bound of the listening port range.
    pub max_port: u16,
    /// Concurrent connections beyond this are turned away at accept time.
    pub max_connections: usize,
    /// Bound on the TLS handshake, and on the application handshake after it.
    pub handshake_timeout: Duration,
    /// Optional per-IP limit on connection attempts.
    pub rate_limiter: Option<ConnectionRateLimiter>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            min_port: 45433,
            max_port: 45533,
            max_connections: 1024,
            handshake_timeout: Duration::from_secs(10),
            rate_limiter: None,
        }
    }
}

/// Everything a connection handler gets besides the stream itself.
pub struct ConnectionContext {
    /// The listener's server-level handlers.
    pub server_events: Arc<EventHandlers>,
    /// Flips to `true` (or closes) when the listener shuts down.
    pub shutdown: watch::Receiver<bool>,
    pub handshake_timeout: Duration,
}

/// Called for every peer that completed the mutual TLS handshake.
pub type ConnectionHandler = Arc<
    dyn Fn(TlsStream<TcpStream>, SocketAddr, ConnectionContext) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

struct BoundResource {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// A TLS-terminating server socket that requires and verifies client
/// certificates.
///
/// Only one socket is live at a time: binding while bound closes the previous
/// socket first. Server-level handlers live on the listener itself and
/// survive rebinds.
pub struct SecureListener {
    options: ListenerOptions,
    allocator: PortAllocator,
    events: Arc<EventHandlers>,
    state: ListenerState,
    host: String,
    port: u16,
    bound: Option<BoundResource>,
}

impl SecureListener {
    pub fn new(options: ListenerOptions) -> Self {
        Self::with_allocator(options, PortAllocator::new())
    }

    pub fn with_allocator(options: ListenerOptions, allocator: PortAllocator) -> Self {
        Self {
            options,
            allocator,
            events: Arc::new(EventHandlers::new()),
            state: ListenerState::Unbound,
            host: String::new(),
            port: 0,
            bound: None,
        }
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            host: self.host.clone(),
            port: self.port,
            state: self.state,
        }
    }

    /// Binds a fresh TLS server on a free port of the configured range.
    ///
    /// A currently bound socket is closed first; a failure to close it is
    /// logged and does not prevent the new bind. On failure the listener is
    /// left `Unbound`.
    #[instrument(skip(self, credential, on_connection))]
    pub async fn bind(
        &mut self,
        host: &str,
        credential: &Credential,
        on_connection: ConnectionHandler,
    ) -> Result<ListenerHandle, BrokerError> {
        if self.state == ListenerState::Bound {
            if let Err(e) = self.close().await {
                warn!("Previous listener did not close cleanly: {}", e);
            }
        }

        match self.try_bind(host, credential, on_connection).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.state = ListenerState::Unbound;
                Err(e)
            }
        }
    }

    async fn try_bind(
        &mut self,
        host: &str,
        credential: &Credential,
        on_connection: ConnectionHandler,
    ) -> Result<ListenerHandle, BrokerError> {
        let acceptor = tls::acceptor(credential)?;
        let port = self
            .allocator
            .find_free_port(host, self.options.min_port, self.options.max_port)
            .await?;

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| BrokerError::BindError(format!("{}:{}: {}", host, port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BrokerError::BindError(e.to_string()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            on_connection,
            self.events.clone(),
            self.options.clone(),
            shutdown_rx,
        ));

        self.allocator.reserve(addr.port());
        self.bound = Some(BoundResource {
            addr,
            shutdown,
            accept_task,
        });
        self.state = ListenerState::Bound;
        self.host = host.to_string();
        self.port = addr.port();

        info!("Secure listener bound on {}", addr);
        self.events.emit(
            LISTENING_EVENT,
            &json!({ "host": host, "port": addr.port() }),
        );
        Ok(self.handle())
    }

    /// Returns the bound socket address.
    pub fn address(&self) -> Result<SocketAddr, BrokerError> {
        match (&self.bound, self.state) {
            (Some(resource), ListenerState::Bound) => Ok(resource.addr),
            _ => Err(BrokerError::NotBoundError),
        }
    }

    /// Attaches a server-level handler.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NotBoundError` unless the listener is bound.
    pub fn on(&self, event: &str, handler: Handler) -> Result<(), BrokerError> {
        if self.state != ListenerState::Bound {
            return Err(BrokerError::NotBoundError);
        }
        self.events.on(event, handler);
        Ok(())
    }

    pub fn events(&self) -> &Arc<EventHandlers> {
        &self.events
    }

    /// Stops accepting and signals every open connection to shut down.
    ///
    /// Closing a listener that is not bound only records the `Closed` state.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        let Some(resource) = self.bound.take() else {
            self.state = ListenerState::Closed;
            return Ok(());
        };

        resource.shutdown.send_replace(true);
        self.allocator.release(resource.addr.port());
        self.state = ListenerState::Closed;

        let result = match resource.accept_task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(BrokerError::TeardownError(format!(
                "accept loop on {} failed: {}",
                resource.addr, e
            ))),
        };

        if let Err(e) = &result {
            error!("{}", e);
            self.events.emit(ERROR_EVENT, &json!({ "error": e.to_string() }));
        }
        info!("Secure listener on {} closed", resource.addr);
        self.events.emit(
            CLOSE_EVENT,
            &json!({ "host": self.host, "port": resource.addr.port() }),
        );
        result
    }
}

impl Drop for SecureListener {
    fn drop(&mut self) {
        if let Some(resource) = self.bound.take() {
            resource.shutdown.send_replace(true);
            resource.accept_task.abort();
            self.allocator.release(resource.addr.port());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    on_connection: ConnectionHandler,
    events: Arc<EventHandlers>,
    options: ListenerOptions,
    shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(options.max_connections));
    let mut stop = shutdown.clone();

    loop {
        let (stream, addr) = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        if let Some(limiter) = &options.rate_limiter {
            if !limiter.check(addr.ip()) {
                warn!("Rate limit exceeded for {}", addr);
                continue;
            }
        }

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("Connection limit reached, rejecting {}", addr);
            continue;
        };

        let acceptor = acceptor.clone();
        let on_connection = on_connection.clone();
        let events = events.clone();
        let shutdown = shutdown.clone();
        let handshake_timeout = options.handshake_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let handshake = tokio::time::timeout(handshake_timeout, acceptor.accept(stream));
            let failure = match handshake.await {
                Ok(Ok(tls_stream)) => {
                    debug!("TLS handshake with {} completed", addr);
                    events.emit(SECURE_CONNECTION_EVENT, &json!({ "peer": addr.to_string() }));
                    let ctx = ConnectionContext {
                        server_events: events,
                        shutdown,
                        handshake_timeout,
                    };
                    on_connection(tls_stream, addr, ctx).await;
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handshake timed out".to_string(),
            };

            warn!("TLS handshake with {} failed: {}", addr, failure);
            events.emit(
                TLS_CLIENT_ERROR_EVENT,
                &json!({ "peer": addr.to_string(), "error": failure }),
            );
        });
    }

    debug!("Accept loop stopped");
}
