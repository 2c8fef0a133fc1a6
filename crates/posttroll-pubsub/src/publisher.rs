//! The Publisher (spec.md §4.F): binds a publish socket, optionally runs
//! a Broadcaster announcing it, and serializes outbound sends.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use posttroll_discovery::broadcaster::AdvertisedIdentity;
use posttroll_discovery::Broadcaster;
use posttroll_nameserver::NAMESERVICE_SUBJECT;
use posttroll_transport::{PublishSocket, Transport};
use posttroll_types::{Config, Message, MessageData};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Result;

/// Constructor options for a [`Publisher`] (spec.md §4.F).
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub name: String,
    /// 0 auto-picks a port from the OS's ephemeral range.
    pub port: u16,
    pub aliases: Vec<String>,
    pub broadcast_interval: Duration,
    /// Explicit nameserver targets, overriding multicast discovery
    /// (spec.md §4.C unicast fallback); falls back to `config.nameservers`
    /// when empty.
    pub nameservers: Vec<SocketAddr>,
    /// When true, builds the "silent" variant: no Broadcaster, callers
    /// must register the address out-of-band (spec.md §4.F
    /// "NoisyPublisher is ... default ... a silent variant exists that
    /// omits the Broadcaster").
    pub silent: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 0,
            aliases: Vec::new(),
            broadcast_interval: Broadcaster::DEFAULT_INTERVAL,
            nameservers: Vec::new(),
            silent: false,
        }
    }
}

/// A bound publish socket plus (unless `silent`) the mechanism announcing
/// it: a multicast [`Broadcaster`], or — when explicit `nameservers` are
/// configured — a [`DirectRegistrar`] pushing registrations straight to
/// each one over its request/reply socket.
pub struct Publisher {
    socket: PublishSocket,
    broadcaster: Option<Broadcaster>,
    direct_registrar: Option<DirectRegistrar>,
    address: String,
}

impl Publisher {
    /// Bind the publish socket to `tcp://*:<port>` and, unless
    /// `options.silent`, start announcing `{address, name, aliases}`
    /// (spec.md §4.F `start()`): over multicast by default, or directly to
    /// each configured name service when `nameservers` is non-empty
    /// (spec.md §4.C unicast fallback).
    pub async fn start(options: PublisherOptions, config: &Config) -> Result<Self> {
        let transport = Transport::new(config);
        let socket = bind_publish_socket(&transport, options.port, config).await?;
        let port = socket.local_addr().port();
        let ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let address = format!("tcp://{ip}:{port}");
        tracing::info!(%address, name = %options.name, "publisher bound");

        let nameservers = if !options.nameservers.is_empty() {
            options.nameservers.clone()
        } else {
            config
                .nameservers
                .iter()
                .filter_map(|host| format!("{host}:{}", config.nameserver_port).parse().ok())
                .collect()
        };
        let identity = AdvertisedIdentity {
            address: address.clone(),
            name: options.name.clone(),
            aliases: options.aliases.clone(),
        };

        let (broadcaster, direct_registrar) = if options.silent {
            (None, None)
        } else if !nameservers.is_empty() {
            // A UDP advertisement sent to a name service's TCP reply port
            // (`nameserver_port`) is delivered nowhere, so the unicast
            // fallback registers directly through the same request/reply
            // exchange the Name Service's `have_address`/`stop_address`
            // dispatch already serves (spec.md §4.D ingestion path 2).
            let registrar =
                DirectRegistrar::start(transport, config.clone(), nameservers, identity, options.broadcast_interval);
            (None, Some(registrar))
        } else {
            let group: Ipv4Addr = config.mc_group.parse().map_err(|_| {
                posttroll_discovery::DiscoveryError::MalformedAdvertisement(format!(
                    "invalid mc_group `{}`",
                    config.mc_group
                ))
            })?;
            let iface = config.multicast_interface.as_ref().and_then(|s| s.parse().ok());
            let sender = transport.create_broadcast_sender(group, config.broadcast_port, iface)?;
            (Some(Broadcaster::start(sender, identity, options.broadcast_interval)), None)
        };

        Ok(Self { socket, broadcaster, direct_registrar, address })
    }

    /// The `tcp://host:port` address this publisher is bound and
    /// advertising as.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connected_subscriber_count(&self) -> impl std::future::Future<Output = usize> + '_ {
        self.socket.connected_subscriber_count()
    }

    /// Send a pre-encoded message to every connected subscriber. Safe to
    /// call concurrently; `PublishSocket::send` serializes all sends
    /// behind its internal connection lock (spec.md §4.F).
    pub async fn send(&self, raw_message: &str) -> Result<()> {
        self.socket.send(raw_message.as_bytes()).await?;
        Ok(())
    }

    /// Send a `type=beat` message with no payload, refreshing liveness
    /// without requiring a real message (spec.md §4.F `heartbeat()`).
    pub async fn heartbeat(&self) -> Result<()> {
        let message = Message::new("/", "beat", None, None)?;
        self.send(&message.encode()).await
    }

    /// Idempotent: halt the Broadcaster or DirectRegistrar (either emits a
    /// final stop registration) and stop accepting new subscriber
    /// connections (spec.md §4.F `stop()`).
    pub async fn stop(&mut self) {
        if let Some(mut broadcaster) = self.broadcaster.take() {
            broadcaster.stop();
            broadcaster.join().await;
        }
        if let Some(mut registrar) = self.direct_registrar.take() {
            registrar.stop();
            registrar.join().await;
        }
        self.socket.stop().await;
    }
}

/// Periodically pushes `have_address` registrations directly to explicit
/// name service addresses instead of relying on multicast (spec.md §4.C
/// unicast fallback), using the same request message type the Name
/// Service's dispatch already answers (spec.md §4.D ingestion path 2,
/// §4.E). Emits a final `stop_address` push on stop so those name
/// services evict immediately, mirroring `Broadcaster`'s final-stop
/// pattern.
struct DirectRegistrar {
    task: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl DirectRegistrar {
    fn start(
        transport: Transport,
        config: Config,
        nameservers: Vec<SocketAddr>,
        identity: AdvertisedIdentity,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        push_to_all(&transport, &config, &nameservers, &identity, "have_address").await;
                    }
                }
            }
            push_to_all(&transport, &config, &nameservers, &identity, "stop_address").await;
        });
        Self { task: Some(task), stop_tx }
    }

    /// Idempotent: stop the registration loop and let the spawned task
    /// send the final `stop_address` push.
    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DirectRegistrar {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Send one `type_`-typed registration (`have_address` or `stop_address`)
/// to every address in `nameservers`, over a freshly dialed request
/// socket each time. Failures are logged and skipped; a name service that
/// is temporarily unreachable is simply retried on the next tick.
async fn push_to_all(
    transport: &Transport,
    config: &Config,
    nameservers: &[SocketAddr],
    identity: &AdvertisedIdentity,
    type_: &str,
) {
    let mapping = serde_json::json!({
        "URI": identity.address,
        "service": identity.name,
        "aliases": identity.aliases,
    });
    let message = match Message::new(NAMESERVICE_SUBJECT, type_, Some(MessageData::Mapping(mapping)), Some(config.message_version)) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build direct registration message");
            return;
        }
    };
    let encoded = message.encode();
    for addr in nameservers {
        match transport.create_request_socket(&addr.to_string(), config).await {
            Ok(mut request_socket) => {
                if let Err(e) = request_socket
                    .request(encoded.as_bytes(), posttroll_transport::transport::DEFAULT_REQUEST_TIMEOUT, config)
                    .await
                {
                    tracing::warn!(%addr, error = %e, "failed to push direct registration");
                }
            }
            Err(e) => tracing::warn!(%addr, error = %e, "failed to dial name service for direct registration"),
        }
    }
}

/// Scoped-acquisition wrapper guaranteeing [`Publisher::stop`] runs on
/// every exit path, including a panic unwinding through the scope
/// (spec.md §4.F, §8 "Scoped-acquisition variants release all resources
/// on exception paths"). Graceful async teardown can't run inside a
/// synchronous `Drop`, so the guard hands the publisher off to a
/// detached task on drop, the same "stop signal now, cleanup work
/// proceeds independently" split `Broadcaster::stop`/`join` already
/// uses, generalized the way `posttroll_types::config::ConfigScopeGuard`
/// generalizes scoped release to the config override stack.
pub struct PublisherGuard {
    inner: Option<Publisher>,
}

impl PublisherGuard {
    pub async fn acquire(options: PublisherOptions, config: &Config) -> Result<Self> {
        Ok(Self { inner: Some(Publisher::start(options, config).await?) })
    }
}

impl std::ops::Deref for PublisherGuard {
    type Target = Publisher;
    fn deref(&self) -> &Publisher {
        self.inner.as_ref().expect("PublisherGuard used after drop")
    }
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        if let Some(mut publisher) = self.inner.take() {
            tokio::spawn(async move {
                publisher.stop().await;
            });
        }
    }
}

/// Bind the publish socket. Port 0 picks from `config.publish_port_range`
/// when set (spec.md §4.F/§8 "port 0 allocates a port in the configured
/// range"), trying each candidate in turn until one binds; with no range
/// configured it defers to the OS's own ephemeral range, as before.
async fn bind_publish_socket(transport: &Transport, port: u16, config: &Config) -> Result<PublishSocket> {
    if port != 0 {
        return Ok(transport.create_publish_socket(&format!("0.0.0.0:{port}"), config).await?);
    }
    let Some((low, high)) = config.publish_port_range else {
        return Ok(transport.create_publish_socket("0.0.0.0:0", config).await?);
    };
    for candidate in low..=high {
        match transport.create_publish_socket(&format!("0.0.0.0:{candidate}"), config).await {
            Ok(socket) => return Ok(socket),
            Err(e) => tracing::debug!(candidate, error = %e, "publish port unavailable, trying next"),
        }
    }
    Err(posttroll_transport::TransportError::Connection(format!(
        "no available port in configured range {low}-{high}"
    ))
    .into())
}

/// Best-effort discovery of this host's outbound-facing IPv4 address, by
/// "connecting" a UDP socket (no packets sent) and reading back the
/// local address the kernel would route replies to.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}
