//! UDP broadcast sender/receiver pair backing the discovery plane's
//! multicast traffic (spec.md §4.B, §4.C, §4.D).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::{Result, TransportError};

/// Sends a payload to one or more fixed UDP targets: either the
/// multicast group (advertisement broadcasts) or a list of explicit
/// `nameservers` targets (spec.md §4.C unicast fallback).
pub struct BroadcastSender {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl BroadcastSender {
    /// Bind a UDP socket with `SO_REUSEADDR` for sending to `targets`.
    /// `iface` selects the outgoing multicast interface when sending to a
    /// multicast group; ignored for unicast targets.
    pub fn new(targets: Vec<SocketAddr>, iface: Option<Ipv4Addr>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Some(iface) = iface {
            socket
                .set_multicast_if_v4(&iface)
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { socket, targets })
    }

    /// Send `body` to every configured target. Per-target send failures
    /// (e.g. EHOSTUNREACH) are logged and do not abort the remaining
    /// sends, matching spec.md §7's Broadcaster propagation policy.
    pub async fn send(&self, body: &[u8]) -> Result<()> {
        for target in &self.targets {
            if let Err(e) = self.socket.send_to(body, *target).await {
                tracing::warn!(%target, error = %e, "broadcast send failed");
            }
        }
        Ok(())
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }
}

/// Listens on a multicast group (or plain UDP port in `--no-multicast`
/// mode) for advertisement payloads.
pub struct BroadcastReceiver {
    socket: UdpSocket,
}

impl BroadcastReceiver {
    /// Bind and join `group:port`. When `group` is `None`, binds a plain
    /// UDP socket on `port` without joining any multicast group, used
    /// for `--no-multicast` operation alongside direct `have_address`
    /// pushes.
    pub fn new(group: Option<Ipv4Addr>, port: u16, iface: Option<Ipv4Addr>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Some(group) = group {
            let iface = iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket
                .join_multicast_v4(&group, &iface)
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { socket })
    }

    /// Receive one datagram and the address it arrived from.
    pub async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 65536];
        let (n, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unicast_send_and_receive_on_loopback() {
        let receiver = BroadcastReceiver::new(None, 0, None).unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = BroadcastSender::new(vec![addr], None).unwrap();
        sender.send(b"advertisement").await.unwrap();
        let (body, _from) = receiver.recv().await.unwrap();
        assert_eq!(body, b"advertisement");
    }

    #[test]
    fn sender_reports_its_targets() {
        let targets = vec!["127.0.0.1:9999".parse().unwrap()];
        let sender = BroadcastSender::new(targets.clone(), None).unwrap();
        assert_eq!(sender.targets(), targets.as_slice());
    }
}
