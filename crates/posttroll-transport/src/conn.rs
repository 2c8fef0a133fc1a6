//! A single TCP connection, optionally AEAD-sealed by a [`SessionCipher`].
//!
//! `Conn` is the unit every socket type in `sockets.rs` is built from: it
//! hides whether a given connection is running the `plain` or `secure`
//! backend behind one `send`/`recv` pair.

use tokio::net::TcpStream;

use crate::crypto::SessionCipher;
use crate::framing::{read_frame, write_frame};
use crate::Result;

/// One live connection, carrying a session cipher if the secure backend
/// negotiated one for it.
pub enum Conn {
    Plain(TcpStream),
    Secure(TcpStream, SessionCipher),
}

impl Conn {
    pub async fn send(&mut self, body: &[u8]) -> Result<()> {
        match self {
            Conn::Plain(stream) => write_frame(stream, body).await,
            Conn::Secure(stream, cipher) => {
                let sealed = cipher.seal(body)?;
                write_frame(stream, &sealed).await
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        match self {
            Conn::Plain(stream) => read_frame(stream).await,
            Conn::Secure(stream, cipher) => {
                let sealed = read_frame(stream).await?;
                cipher.open(&sealed)
            }
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        match self {
            Conn::Plain(stream) => stream.peer_addr(),
            Conn::Secure(stream, _) => stream.peer_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

    async fn loopback_pair() -> (TokioTcpStream, TokioTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TokioTcpStream::connect(addr), async { listener.accept().await.unwrap() });
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn plain_roundtrip() {
        let (client, server) = loopback_pair().await;
        let mut client = Conn::Plain(client);
        let mut server = Conn::Plain(server);
        client.send(b"ping").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn secure_roundtrip() {
        use crate::crypto::{client_handshake, server_handshake, ClientIdentity, ServerIdentity, X25519StaticSecret};
        use std::collections::HashSet;

        let (mut client_stream, mut server_stream) = loopback_pair().await;
        let server_secret = X25519StaticSecret::random();
        let client_secret = X25519StaticSecret::random();
        let mut accepted = HashSet::new();
        accepted.insert(client_secret.public_key().to_bytes());
        let client_identity = ClientIdentity {
            secret: client_secret,
            server_public: server_secret.public_key(),
        };
        let server_identity = ServerIdentity {
            secret: server_secret,
            accepted_client_keys: accepted,
        };

        let (client_cipher, server_cipher) = tokio::join!(
            client_handshake(&mut client_stream, &client_identity),
            server_handshake(&mut server_stream, &server_identity),
        );
        let mut client = Conn::Secure(client_stream, client_cipher.unwrap());
        let mut server = Conn::Secure(server_stream, server_cipher.unwrap());
        client.send(b"ping").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"ping");
    }
}
