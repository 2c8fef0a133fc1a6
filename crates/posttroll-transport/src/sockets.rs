//! The five socket types the Transport Abstraction exposes (spec.md
//! §4.B): publish, subscribe, request, and reply sockets, built from
//! [`Conn`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use posttroll_types::config::Backend;
use posttroll_types::Config;

use crate::conn::Conn;
use crate::crypto::{client_handshake, server_handshake, ClientIdentity, ServerIdentity};
use crate::keepalive::apply_tcp_keepalive;
use crate::{Result, TransportError};

fn load_server_identity(config: &Config) -> Result<ServerIdentity> {
    let secret_path = config.server_secret_key_file.as_ref().ok_or_else(|| {
        TransportError::Crypto("secure backend requires server_secret_key_file".to_string())
    })?;
    let dir = config.clients_public_keys_directory.as_ref().ok_or_else(|| {
        TransportError::Crypto("secure backend requires clients_public_keys_directory".to_string())
    })?;
    Ok(ServerIdentity {
        secret: crate::crypto::X25519StaticSecret::from_bytes(crate::crypto::read_key_file(secret_path)?),
        accepted_client_keys: crate::crypto::load_accepted_keys(dir)?,
    })
}

fn load_client_identity(config: &Config) -> Result<ClientIdentity> {
    let secret_path = config.client_secret_key_file.as_ref().ok_or_else(|| {
        TransportError::Crypto("secure backend requires client_secret_key_file".to_string())
    })?;
    let server_public_path = config.server_public_key_file.as_ref().ok_or_else(|| {
        TransportError::Crypto("secure backend requires server_public_key_file".to_string())
    })?;
    Ok(ClientIdentity {
        secret: crate::crypto::X25519StaticSecret::from_bytes(crate::crypto::read_key_file(secret_path)?),
        server_public: crate::crypto::X25519PublicKey::from_bytes(crate::crypto::read_key_file(
            server_public_path,
        )?),
    })
}

async fn accept_conn(stream: TcpStream, backend: Backend, identity: Option<&ServerIdentity>) -> Result<Conn> {
    match backend {
        Backend::Plain => Ok(Conn::Plain(stream)),
        Backend::Secure => {
            let identity = identity
                .ok_or_else(|| TransportError::Crypto("secure backend identity not loaded".to_string()))?;
            let mut stream = stream;
            let cipher = server_handshake(&mut stream, identity).await?;
            Ok(Conn::Secure(stream, cipher))
        }
    }
}

async fn dial_conn(stream: TcpStream, backend: Backend, identity: Option<&ClientIdentity>) -> Result<Conn> {
    match backend {
        Backend::Plain => Ok(Conn::Plain(stream)),
        Backend::Secure => {
            let identity = identity
                .ok_or_else(|| TransportError::Crypto("secure backend identity not loaded".to_string()))?;
            let mut stream = stream;
            let cipher = client_handshake(&mut stream, identity).await?;
            Ok(Conn::Secure(stream, cipher))
        }
    }
}

/// A publisher's outbound socket: binds one listener, fans every `send`
/// out to all currently connected subscribers.
pub struct PublishSocket {
    local_addr: SocketAddr,
    conns: Arc<Mutex<Vec<Conn>>>,
    accept_task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl PublishSocket {
    pub(crate) async fn bind(bind_addr: &str, backend: Backend, config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Connection(format!("bind {bind_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local_addr, "publish socket bound");

        let identity = match backend {
            Backend::Secure => Some(Arc::new(load_server_identity(config)?)),
            Backend::Plain => None,
        };
        let conns: Arc<Mutex<Vec<Conn>>> = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let conns_task = conns.clone();
        let config_task = config.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if let Err(e) = apply_tcp_keepalive(&stream, &config_task) {
                                    tracing::warn!(%peer, error = %e, "failed to apply keepalive");
                                }
                                let identity = identity.clone();
                                let conns = conns_task.clone();
                                tokio::spawn(async move {
                                    match accept_conn(stream, backend, identity.as_deref()).await {
                                        Ok(conn) => conns.lock().await.push(conn),
                                        Err(e) => tracing::warn!(%peer, error = %e, "dropping unauthenticated subscriber connection"),
                                    }
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "publish socket accept failed"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            conns,
            accept_task,
            stop_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a framed message to every currently connected subscriber.
    /// Concurrent callers are serialized by the internal connection lock
    /// (spec.md §4.F "all sends are serialized by a lock").
    pub async fn send(&self, body: &[u8]) -> Result<()> {
        let mut conns = self.conns.lock().await;
        let mut dead = Vec::new();
        for (i, conn) in conns.iter_mut().enumerate() {
            if conn.send(body).await.is_err() {
                dead.push(i);
            }
        }
        for i in dead.into_iter().rev() {
            conns.remove(i);
        }
        Ok(())
    }

    pub async fn connected_subscriber_count(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Idempotent: stops the accept loop. Calling this more than once is
    /// safe (spec.md §8 "`stop()` is idempotent").
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for PublishSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// A subscriber's connection to exactly one publisher. The Subscriber
/// component owns a map of these keyed by publisher URI (spec.md §9
/// "classic set of owned resources keyed by URI").
pub struct SubscribeSocket {
    backend: Backend,
    conn: Option<Conn>,
}

impl SubscribeSocket {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend, conn: None }
    }

    /// Dial the publisher at `address`, performing the secure handshake
    /// if configured.
    pub async fn connect(&mut self, address: &str, config: &Config) -> Result<()> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connection(format!("connect {address}: {e}")))?;
        apply_tcp_keepalive(&stream, config)?;
        let identity = match self.backend {
            Backend::Secure => Some(load_client_identity(config)?),
            Backend::Plain => None,
        };
        let conn = dial_conn(stream, self.backend, identity.as_ref()).await?;
        self.conn = Some(conn);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Receive one decoded frame, bounded by `timeout` if given.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| TransportError::Connection("subscribe socket is not connected".to_string()))?;
        match timeout {
            Some(d) => tokio::time::timeout(d, conn.recv())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => conn.recv().await,
        }
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }
}

/// A client-side request/reply socket: one persistent connection to a
/// reply server, reconnected transparently on the next `request` call if
/// the connection was lost.
pub struct RequestSocket {
    backend: Backend,
    address: String,
    conn: Option<Conn>,
}

impl RequestSocket {
    pub(crate) async fn dial(address: &str, backend: Backend, config: &Config) -> Result<Self> {
        let mut socket = Self {
            backend,
            address: address.to_string(),
            conn: None,
        };
        socket.reconnect(config).await?;
        Ok(socket)
    }

    async fn reconnect(&mut self, config: &Config) -> Result<()> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::Connection(format!("connect {}: {e}", self.address)))?;
        apply_tcp_keepalive(&stream, config)?;
        let identity = match self.backend {
            Backend::Secure => Some(load_client_identity(config)?),
            Backend::Plain => None,
        };
        self.conn = Some(dial_conn(stream, self.backend, identity.as_ref()).await?);
        Ok(())
    }

    /// Send one request and await its reply, bounded by `timeout`.
    pub async fn request(&mut self, body: &[u8], timeout: Duration, config: &Config) -> Result<Vec<u8>> {
        if self.conn.is_none() {
            self.reconnect(config).await?;
        }
        let outcome = tokio::time::timeout(timeout, async {
            let conn = self.conn.as_mut().expect("just ensured connected");
            conn.send(body).await?;
            conn.recv().await
        })
        .await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                Err(TransportError::Timeout)
            }
        }
    }
}

/// One inbound request awaiting a reply on a [`ReplySocket`].
pub struct PendingRequest {
    pub body: Vec<u8>,
    pub peer: SocketAddr,
    reply_tx: oneshot::Sender<Vec<u8>>,
}

impl PendingRequest {
    /// Send the reply back to the requester.
    pub fn reply(self, body: Vec<u8>) {
        let _ = self.reply_tx.send(body);
    }
}

/// A server-side request/reply socket: accepts connections and serves a
/// request/reply loop on each, matching the Name Service's front-end
/// (spec.md §4.E).
pub struct ReplySocket {
    local_addr: SocketAddr,
    requests_rx: Mutex<mpsc::Receiver<PendingRequest>>,
    accept_task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl ReplySocket {
    pub(crate) async fn bind(bind_addr: &str, backend: Backend, config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Connection(format!("bind {bind_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local_addr, "reply socket bound");

        let identity = match backend {
            Backend::Secure => Some(Arc::new(load_server_identity(config)?)),
            Backend::Plain => None,
        };
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let config_task = config.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if let Err(e) = apply_tcp_keepalive(&stream, &config_task) {
                                    tracing::warn!(%peer, error = %e, "failed to apply keepalive");
                                }
                                let identity = identity.clone();
                                let requests_tx = requests_tx.clone();
                                tokio::spawn(async move {
                                    let mut conn = match accept_conn(stream, backend, identity.as_deref()).await {
                                        Ok(conn) => conn,
                                        Err(e) => {
                                            tracing::warn!(%peer, error = %e, "dropping unauthenticated requester connection");
                                            return;
                                        }
                                    };
                                    loop {
                                        let body = match conn.recv().await {
                                            Ok(body) => body,
                                            Err(_) => break,
                                        };
                                        let (reply_tx, reply_rx) = oneshot::channel();
                                        if requests_tx
                                            .send(PendingRequest { body, peer, reply_tx })
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                        let Ok(reply) = reply_rx.await else { break };
                                        if conn.send(&reply).await.is_err() {
                                            break;
                                        }
                                    }
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "reply socket accept failed"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            requests_rx: Mutex::new(requests_rx),
            accept_task,
            stop_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound request.
    pub async fn recv_request(&self) -> Result<PendingRequest> {
        self.requests_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::Connection("reply socket closed".to_string()))
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
