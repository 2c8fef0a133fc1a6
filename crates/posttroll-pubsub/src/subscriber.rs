//! The Subscriber (spec.md §4.G): discovers publishers for a set of
//! requested services either via a name service poll loop or a fixed
//! address list, dials each, and filters inbound messages by subject
//! prefix.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use posttroll_nameserver::NAMESERVICE_SUBJECT;
use posttroll_transport::{SubscribeSocket, Transport};
use posttroll_types::{Config, Message, MessageData};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::{PubSubError, Result};

/// Default interval between name-service polls for new/lost addresses
/// (spec.md §4.G).
pub const DEFAULT_ADDR_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// A caller-supplied predicate applied after subject-prefix filtering
/// (spec.md §4.G `message_filter`). A message is yielded only when this
/// also returns `true`.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Constructor options for a [`Subscriber`] (spec.md §4.G).
#[derive(Clone)]
pub struct SubscriberOptions {
    /// Service names to discover via the name service. Empty means
    /// "every live address" (spec.md §4.D `get("")`).
    pub services: Vec<String>,
    /// Subject prefixes a message must start with to be delivered;
    /// empty means no filtering.
    pub topics: Vec<String>,
    /// Fixed publisher addresses to connect to directly, bypassing name
    /// service discovery entirely (spec.md §4.G "addresses bypass mode").
    pub addresses: Vec<String>,
    pub addr_refresh_interval: Duration,
    /// Name service address to poll; falls back to
    /// `config.nameservers[0]:config.nameserver_port` when `None`.
    pub nameserver: Option<SocketAddr>,
    /// Optional caller predicate applied on top of subject-prefix
    /// filtering (spec.md §4.G "applies optional user filter, yields").
    pub message_filter: Option<MessageFilter>,
}

impl std::fmt::Debug for SubscriberOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("services", &self.services)
            .field("topics", &self.topics)
            .field("addresses", &self.addresses)
            .field("addr_refresh_interval", &self.addr_refresh_interval)
            .field("nameserver", &self.nameserver)
            .field("message_filter", &self.message_filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            topics: Vec::new(),
            addresses: Vec::new(),
            addr_refresh_interval: DEFAULT_ADDR_REFRESH_INTERVAL,
            nameserver: None,
            message_filter: None,
        }
    }
}

/// A per-publisher connection's lifecycle state (spec.md §4.G "unknown →
/// discovered → connected → (lost → disconnected)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherState {
    Connected,
    Lost,
}

struct PublisherConn {
    state: PublisherState,
    recv_task: JoinHandle<()>,
}

impl Drop for PublisherConn {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

type Conns = Arc<Mutex<HashMap<String, PublisherConn>>>;

/// Dynamically connects to every publisher matching `options.services`
/// (or `options.addresses` directly) and yields filtered, decoded
/// messages through [`Subscriber::recv`].
pub struct Subscriber {
    message_rx: Mutex<mpsc::Receiver<Message>>,
    conns: Conns,
    listener_task: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl Subscriber {
    /// Start discovering and connecting to publishers. In "addresses"
    /// mode (`options.addresses` non-empty) this dials each address once
    /// and never polls a name service.
    pub async fn start(options: SubscriberOptions, config: &Config) -> Result<Self> {
        let (message_tx, message_rx) = mpsc::channel(256);
        let conns: Conns = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        if !options.addresses.is_empty() {
            for address in &options.addresses {
                connect_one(
                    address.clone(),
                    options.topics.clone(),
                    options.message_filter.clone(),
                    config.clone(),
                    conns.clone(),
                    message_tx.clone(),
                )
                .await;
            }
            return Ok(Self { message_rx: Mutex::new(message_rx), conns, listener_task: None, stop_tx });
        }

        let nameserver_addr = match options.nameserver {
            Some(addr) => addr,
            None => {
                let host = config
                    .nameservers
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                format!("{host}:{}", config.nameserver_port)
                    .parse()
                    .map_err(|_| {
                        PubSubError::AddressNotFound(format!(
                            "malformed nameserver address `{host}:{}`",
                            config.nameserver_port
                        ))
                    })?
            }
        };

        let services = options.services.clone();
        let topics = options.topics.clone();
        let message_filter = options.message_filter.clone();
        let refresh_interval = options.addr_refresh_interval;
        let config_task = config.clone();
        let conns_task = conns.clone();
        let mut stop_rx_task = stop_rx.clone();

        let listener_task = tokio::spawn(async move {
            let transport = Transport::new(&config_task);
            let mut ticker = tokio::time::interval(refresh_interval);
            loop {
                tokio::select! {
                    changed = stop_rx_task.changed() => {
                        if changed.is_err() || *stop_rx_task.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let known = if services.is_empty() {
                            vec![String::new()]
                        } else {
                            services.clone()
                        };
                        for service in known {
                            if let Err(e) = poll_once(
                                &transport,
                                nameserver_addr,
                                &service,
                                &config_task,
                                &topics,
                                message_filter.clone(),
                                &conns_task,
                                &message_tx,
                            )
                            .await
                            {
                                tracing::warn!(error = %e, %service, "name service poll failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            message_rx: Mutex::new(message_rx),
            conns,
            listener_task: Some(listener_task),
            stop_tx,
        })
    }

    /// Receive the next message passing the subject-prefix filter,
    /// bounded by `timeout` if given.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Message> {
        let mut rx = self.message_rx.lock().await;
        let next = match timeout {
            Some(d) => tokio::time::timeout(d, rx.recv())
                .await
                .map_err(|_| posttroll_transport::TransportError::Timeout)?,
            None => rx.recv().await,
        };
        next.ok_or_else(|| PubSubError::Transport(posttroll_transport::TransportError::Connection(
            "subscriber message channel closed".to_string(),
        )))
    }

    /// Number of publishers currently connected.
    pub async fn connected_count(&self) -> usize {
        self.conns
            .lock()
            .await
            .values()
            .filter(|c| c.state == PublisherState::Connected)
            .count()
    }

    /// Idempotent: stop the address-refresh loop and close every
    /// publisher connection (spec.md §8 `stop()` idempotence).
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.listener_task.take() {
            let _ = task.await;
        }
        self.conns.lock().await.clear();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}

/// Query the name service once for `service`'s live addresses, connect
/// to any not already known, and drop connections whose address is no
/// longer listed (spec.md §4.G address-refresh tick).
#[allow(clippy::too_many_arguments)]
async fn poll_once(
    transport: &Transport,
    nameserver_addr: SocketAddr,
    service: &str,
    config: &Config,
    topics: &[String],
    message_filter: Option<MessageFilter>,
    conns: &Conns,
    message_tx: &mpsc::Sender<Message>,
) -> Result<()> {
    let mut request_socket = transport
        .create_request_socket(&nameserver_addr.to_string(), config)
        .await?;
    let request = Message::new(
        NAMESERVICE_SUBJECT,
        "request",
        Some(MessageData::Mapping(serde_json::json!({ "service": service }))),
        Some(config.message_version),
    )?;
    let reply_raw = request_socket
        .request(request.encode().as_bytes(), posttroll_transport::transport::DEFAULT_REQUEST_TIMEOUT, config)
        .await?;
    let reply = Message::decode(std::str::from_utf8(&reply_raw).map_err(|e| {
        posttroll_transport::TransportError::Io(e.to_string())
    })?)?;

    let addresses: Vec<String> = match reply.data {
        MessageData::Mapping(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("URI").and_then(|v| v.as_str()).map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let mut guard = conns.lock().await;
    for address in &addresses {
        if !guard.contains_key(address) {
            drop(guard);
            connect_one(
                address.clone(),
                topics.to_vec(),
                message_filter.clone(),
                config.clone(),
                conns.clone(),
                message_tx.clone(),
            )
            .await;
            guard = conns.lock().await;
        }
    }
    let live: std::collections::HashSet<&String> = addresses.iter().collect();
    guard.retain(|address, _| live.contains(address));
    Ok(())
}

/// Dial `address` and spawn its receive loop, registering the connection
/// as `Connected` before any data has arrived (spec.md §4.G "discovered
/// → connected" transition happens at dial time, not first message).
async fn connect_one(
    address: String,
    topics: Vec<String>,
    message_filter: Option<MessageFilter>,
    config: Config,
    conns: Conns,
    message_tx: mpsc::Sender<Message>,
) {
    let transport = Transport::new(&config);
    let mut socket: SubscribeSocket = transport.create_subscribe_socket();
    let dial_addr = address.strip_prefix("tcp://").unwrap_or(&address);
    if let Err(e) = socket.connect(dial_addr, &config).await {
        tracing::warn!(%address, error = %e, "failed to connect to discovered publisher");
        return;
    }

    let recv_task = tokio::spawn(recv_loop(address.clone(), socket, topics, message_filter, message_tx, conns.clone()));
    conns.lock().await.insert(address, PublisherConn { state: PublisherState::Connected, recv_task });
}

async fn recv_loop(
    address: String,
    mut socket: SubscribeSocket,
    topics: Vec<String>,
    message_filter: Option<MessageFilter>,
    message_tx: mpsc::Sender<Message>,
    conns: Conns,
) {
    loop {
        match socket.recv(None).await {
            Ok(bytes) => {
                let raw = match std::str::from_utf8(&bytes) {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                let message = match Message::decode(raw) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(%address, error = %e, "dropping malformed message");
                        continue;
                    }
                };
                if !passes_topic_filter(&message.subject, &topics) {
                    continue;
                }
                if let Some(filter) = &message_filter {
                    if !filter(&message) {
                        continue;
                    }
                }
                if message_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Some(conn) = conns.lock().await.get_mut(&address) {
                    conn.state = PublisherState::Lost;
                }
                tracing::info!(%address, "lost connection to publisher");
                break;
            }
        }
    }
}

/// A message passes when `topics` is empty or the subject starts with
/// one of them (spec.md §4.G subject-prefix filtering).
fn passes_topic_filter(subject: &str, topics: &[String]) -> bool {
    topics.is_empty() || topics.iter().any(|t| subject.starts_with(t.as_str()))
}
