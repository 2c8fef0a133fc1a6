//! The Transport Abstraction's five factory operations (spec.md §4.B),
//! selecting between the `plain` and `secure` backends declared in
//! [`Config`].

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use posttroll_types::config::Backend;
use posttroll_types::Config;

use crate::broadcast::{BroadcastReceiver, BroadcastSender};
use crate::sockets::{PublishSocket, ReplySocket, RequestSocket, SubscribeSocket};
use crate::Result;

/// Backend-selecting factory for every socket type PostTroll uses.
///
/// At most one `Transport` is needed per process; it is cheap to
/// construct (it holds no state beyond the backend selector; key
/// material is loaded per-socket from [`Config`] at construction time),
/// matching spec.md §5's "constructed lazily, usable across
/// forked/spawned child processes via explicit renewal".
#[derive(Clone, Copy)]
pub struct Transport {
    backend: Backend,
}

impl Transport {
    /// Construct a transport for the backend named in `config.backend`.
    pub fn new(config: &Config) -> Self {
        Self {
            backend: config.backend,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Bind a publish socket at `bind_addr` (e.g. `0.0.0.0:0` to
    /// auto-pick a port).
    pub async fn create_publish_socket(&self, bind_addr: &str, config: &Config) -> Result<PublishSocket> {
        PublishSocket::bind(bind_addr, self.backend, config).await
    }

    /// Create an unconnected subscribe socket; call
    /// [`SubscribeSocket::connect`] to dial a discovered publisher.
    pub fn create_subscribe_socket(&self) -> SubscribeSocket {
        SubscribeSocket::new(self.backend)
    }

    /// Dial a request socket at `address` (a name service's
    /// `nameserver_port`, or a publisher accepting direct pushes).
    pub async fn create_request_socket(&self, address: &str, config: &Config) -> Result<RequestSocket> {
        RequestSocket::dial(address, self.backend, config).await
    }

    /// Bind a reply socket at `bind_addr` (the Name Service's front end).
    pub async fn create_reply_socket(&self, bind_addr: &str, config: &Config) -> Result<ReplySocket> {
        ReplySocket::bind(bind_addr, self.backend, config).await
    }

    /// Create a broadcast sender targeting the multicast group `group:port`.
    /// Publishers with explicit `nameservers` configured skip this sender
    /// entirely and push registrations directly over a request socket
    /// instead (spec.md §4.C unicast fallback; see `posttroll-pubsub`'s
    /// `Publisher`), since a UDP datagram to a TCP reply port is delivered
    /// nowhere.
    pub fn create_broadcast_sender(
        &self,
        group: Ipv4Addr,
        port: u16,
        iface: Option<Ipv4Addr>,
    ) -> Result<BroadcastSender> {
        BroadcastSender::new(vec![SocketAddr::from((group, port))], iface)
    }

    /// Create a broadcast receiver joined to `group:port`, or a plain
    /// unjoined UDP socket when `group` is `None` (`--no-multicast`).
    pub fn create_broadcast_receiver(
        &self,
        group: Option<Ipv4Addr>,
        port: u16,
        iface: Option<Ipv4Addr>,
    ) -> Result<BroadcastReceiver> {
        BroadcastReceiver::new(group, port, iface)
    }
}

/// Default request/reply timeout used when a caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
