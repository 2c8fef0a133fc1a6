//! # posttroll-nameserver
//!
//! The Name Service (spec.md §4.E): a process hosting one
//! [`AddressReceiver`] and a request/reply socket on `nameserver_port`.
//! Accepts `request` messages carrying `data.service` and replies with
//! the matching address list; accepts `have_address`/`stop_address`
//! control messages for publishers that cannot multicast.

pub mod pidfile;

use std::net::Ipv4Addr;
use std::time::Duration;

use std::sync::Arc;

use posttroll_discovery::AddressReceiver;
use posttroll_transport::{PendingRequest, ReplySocket, Transport};
use posttroll_types::{Config, Message, MessageData, MessageVersion};
use tokio::task::JoinHandle;

/// Subject every name-service request/reply travels on (spec.md §6).
pub const NAMESERVICE_SUBJECT: &str = "/oper/ns";

#[derive(Debug, thiserror::Error)]
pub enum NameServiceError {
    #[error("transport error: {0}")]
    Transport(#[from] posttroll_transport::TransportError),
    #[error("discovery error: {0}")]
    Discovery(#[from] posttroll_discovery::DiscoveryError),
    #[error("message error: {0}")]
    Message(#[from] posttroll_types::MessageError),
}

pub type Result<T> = std::result::Result<T, NameServiceError>;

/// Options controlling a [`NameService`]'s bind behavior (spec.md §6 CLI
/// flags).
#[derive(Debug, Clone)]
pub struct NameServiceOptions {
    pub no_multicast: bool,
    pub restrict_to_localhost: bool,
    pub max_age: Duration,
}

impl Default for NameServiceOptions {
    fn default() -> Self {
        Self {
            no_multicast: false,
            restrict_to_localhost: false,
            max_age: Duration::from_secs(10),
        }
    }
}

/// Hosts the Address Receiver and its two ingestion/serving front ends:
/// the multicast listener (unless `--no-multicast`) and the reply socket
/// (spec.md §4.E).
pub struct NameService {
    receiver: Arc<AddressReceiver>,
    reply: Arc<ReplySocket>,
    broadcast_addr: std::net::SocketAddr,
    version: MessageVersion,
    serve_task: Option<JoinHandle<()>>,
}

impl NameService {
    /// Bind the reply socket and (unless `options.no_multicast`) the
    /// multicast listener, and start serving requests.
    pub async fn start(config: &Config, options: NameServiceOptions) -> Result<Self> {
        let bind_host = if options.restrict_to_localhost { "127.0.0.1" } else { "0.0.0.0" };
        let reply_addr = format!("{bind_host}:{}", config.nameserver_port);

        let transport = Transport::new(config);
        let reply = transport.create_reply_socket(&reply_addr, config).await?;
        tracing::info!(address = %reply.local_addr(), "name service reply socket bound");

        let mut receiver = AddressReceiver::new(options.max_age);
        // `--no-multicast` still binds a plain UDP socket on
        // `broadcast_port` (just without joining the multicast group), so
        // publishers configured with an explicit `nameservers` target can
        // still reach us by unicast (spec.md §8 scenario 4).
        let group = if options.no_multicast {
            None
        } else {
            let group: Ipv4Addr = config.mc_group.parse().map_err(|_| {
                NameServiceError::Discovery(posttroll_discovery::DiscoveryError::MalformedAdvertisement(
                    format!("invalid mc_group `{}`", config.mc_group),
                ))
            })?;
            Some(group)
        };
        let iface = config
            .multicast_interface
            .as_ref()
            .and_then(|s| s.parse().ok());
        let broadcast_receiver = transport.create_broadcast_receiver(group, config.broadcast_port, iface)?;
        let broadcast_addr = broadcast_receiver
            .local_addr()
            .map_err(|e| NameServiceError::Discovery(posttroll_discovery::DiscoveryError::Transport(
                posttroll_transport::TransportError::Io(e.to_string()),
            )))?;
        receiver.start(Some(broadcast_receiver));

        let mut service = Self {
            receiver: Arc::new(receiver),
            reply: Arc::new(reply),
            broadcast_addr,
            version: config.message_version,
            serve_task: None,
        };
        service.serve();
        Ok(service)
    }

    /// Spawn the request-serving loop: pulls accepted requests off the
    /// reply socket's queue and answers each with [`NameService::dispatch`].
    /// Exits once the reply socket is stopped and its queue drains.
    fn serve(&mut self) {
        let reply = self.reply.clone();
        let receiver = self.receiver.clone();
        let version = self.version;
        self.serve_task = Some(tokio::spawn(async move {
            loop {
                match reply.recv_request().await {
                    Ok(pending) => {
                        if let Err(e) = handle_one(&receiver, pending, version) {
                            tracing::warn!(error = %e, "failed to answer name-service request");
                        }
                    }
                    Err(_) => break,
                }
            }
        }));
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.reply.local_addr()
    }

    /// Where a publisher's unicast `nameservers` fallback should send
    /// advertisements (spec.md §4.C), whether or not multicast is joined.
    pub fn broadcast_addr(&self) -> std::net::SocketAddr {
        self.broadcast_addr
    }

    pub fn receiver(&self) -> &AddressReceiver {
        self.receiver.as_ref()
    }

    /// Idempotent: stop the reply socket, the serve loop, and the
    /// underlying Address Receiver's background tasks.
    pub async fn stop(&mut self) {
        self.reply.stop().await;
        self.receiver.stop();
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NameService {
    fn drop(&mut self) {
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}

/// Process one inbound request/reply exchange: decode the body as a
/// [`Message`], dispatch by `type_`, and send the encoded reply.
fn handle_one(receiver: &AddressReceiver, pending: PendingRequest, version: MessageVersion) -> Result<()> {
    let raw = String::from_utf8_lossy(&pending.body);
    let reply_body = match Message::decode(&raw) {
        Ok(message) => dispatch(receiver, &message, version)?,
        Err(e) => {
            tracing::warn!(error = %e, raw = %raw, "dropping malformed name-service request");
            Message::new(NAMESERVICE_SUBJECT, "info", Some(MessageData::Mapping(serde_json::json!([]))), Some(version))?
                .encode()
        }
    };
    pending.reply(reply_body.into_bytes());
    Ok(())
}

fn dispatch(receiver: &AddressReceiver, message: &Message, version: MessageVersion) -> Result<String> {
    match message.type_.as_str() {
        "request" => {
            let service = match &message.data {
                MessageData::Mapping(value) => value
                    .get("service")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                _ => String::new(),
            };
            let records = receiver.get(&service);
            let addresses: Vec<_> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "URI": r.address,
                        "service": r.name,
                        "aliases": r.aliases,
                    })
                })
                .collect();
            let reply = Message::new(
                NAMESERVICE_SUBJECT,
                "info",
                Some(MessageData::Mapping(serde_json::Value::Array(addresses))),
                Some(version),
            )?;
            Ok(reply.encode())
        }
        "have_address" | "stop_address" => {
            if message.type_ == "stop_address" {
                if let MessageData::Mapping(value) = &message.data {
                    if let Some(uri) = value.get("URI").and_then(|v| v.as_str()) {
                        receiver.evict(uri);
                    }
                }
            } else {
                receiver.register_direct(message)?;
            }
            let reply = Message::new(
                NAMESERVICE_SUBJECT,
                "info",
                Some(MessageData::Text("ok".to_string())),
                Some(version),
            )?;
            Ok(reply.encode())
        }
        other => {
            tracing::warn!(type_ = other, "unrecognized name-service request type");
            let reply = Message::new(
                NAMESERVICE_SUBJECT,
                "info",
                Some(MessageData::Mapping(serde_json::json!([]))),
                Some(version),
            )?;
            Ok(reply.encode())
        }
    }
}
