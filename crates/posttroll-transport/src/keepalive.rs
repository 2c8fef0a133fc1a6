//! Applies the `tcp_keepalive*` config keys to a TCP socket at
//! accept/connect time via [`socket2::SockRef`].

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

use posttroll_types::Config;

use crate::{Result, TransportError};

/// Apply the current keepalive settings to a connected TCP stream.
///
/// A no-op when `config.tcp_keepalive` is `false`.
pub fn apply_tcp_keepalive(stream: &TcpStream, config: &Config) -> Result<()> {
    if !config.tcp_keepalive {
        return Ok(());
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(u64::from(config.tcp_keepalive_idle)))
        .with_interval(Duration::from_secs(u64::from(config.tcp_keepalive_intvl)));
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    let keepalive = keepalive.with_retries(config.tcp_keepalive_cnt);

    let sock_ref = SockRef::from(stream);
    sock_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| TransportError::Io(format!("failed to set TCP keepalive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applies_without_error_on_a_real_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let client = client.unwrap();
        let config = Config::default();
        apply_tcp_keepalive(&client, &config).unwrap();
        apply_tcp_keepalive(&server, &config).unwrap();
    }

    #[tokio::test]
    async fn disabled_keepalive_is_a_no_op() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let client = client.unwrap();
        let mut config = Config::default();
        config.tcp_keepalive = false;
        apply_tcp_keepalive(&client, &config).unwrap();
    }
}
