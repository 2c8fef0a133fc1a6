//! X25519 key agreement and ChaCha20-Poly1305 frame encryption for the
//! secure backend.
//!
//! A secure-backend connection performs one unauthenticated-but-verified
//! handshake: the connecting side sends its static public key in the
//! clear as the first frame; the accepting side checks it against its
//! directory of accepted client keys and, if authorized, derives a pair
//! of directional session keys from the X25519 Diffie-Hellman shared
//! secret via [`blake3::derive_key`]. There is no forward secrecy (keys
//! are static, matching the curve-style long-term-key authentication
//! spec.md §4.B describes); an unauthorized peer's connection is closed
//! without a reply, which the connecting side observes as
//! [`TransportError::Connection`].

use std::collections::HashSet;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::framing::{read_frame, write_frame};
use crate::{Result, TransportError};

const NONCE_SIZE: usize = 12;

const CLIENT_TO_SERVER_CONTEXT: &str = "posttroll-transport v1 client-to-server";
const SERVER_TO_CLIENT_CONTEXT: &str = "posttroll-transport v1 server-to-client";

/// An X25519 static secret key, zeroed on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey {
            bytes: PublicKey::from(&self.inner).to_bytes(),
        }
    }

    fn diffie_hellman(&self, their_public: &X25519PublicKey) -> [u8; 32] {
        let pk = PublicKey::from(their_public.bytes);
        *self.inner.diffie_hellman(&pk).as_bytes()
    }
}

impl X25519PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.bytes
    }
}

/// A pair of directional AEAD keys derived for one connection, with a
/// monotonically increasing nonce counter per direction.
pub struct SessionCipher {
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_counter: u64,
    recv_counter: u64,
}

impl SessionCipher {
    fn new(send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self {
            send_key,
            recv_key,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Encrypt one frame body, advancing the send nonce counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.send_counter);
        self.send_counter = self.send_counter.wrapping_add(1);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.send_key));
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| TransportError::Crypto("frame encryption failed".to_string()))
    }

    /// Decrypt one frame body, advancing the receive nonce counter.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.recv_counter);
        self.recv_counter = self.recv_counter.wrapping_add(1);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.recv_key));
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| TransportError::Crypto("frame decryption or authentication failed".to_string()))
    }
}

fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn derive_session_keys(shared: [u8; 32], is_client: bool) -> ([u8; 32], [u8; 32]) {
    let c2s = blake3::derive_key(CLIENT_TO_SERVER_CONTEXT, &shared);
    let s2c = blake3::derive_key(SERVER_TO_CLIENT_CONTEXT, &shared);
    if is_client {
        (c2s, s2c)
    } else {
        (s2c, c2s)
    }
}

/// Identity material a secure-backend server socket authenticates
/// connecting clients against.
pub struct ServerIdentity {
    pub secret: X25519StaticSecret,
    pub accepted_client_keys: HashSet<[u8; 32]>,
}

/// Identity material a secure-backend client socket presents, plus the
/// server public key it expects to be talking to.
pub struct ClientIdentity {
    pub secret: X25519StaticSecret,
    pub server_public: X25519PublicKey,
}

/// Server-side handshake: read the connecting peer's public key, check
/// authorization, and derive the session cipher.
///
/// Returns [`TransportError::Connection`] if the peer's key is not in
/// `identity.accepted_client_keys`; the socket should be dropped by the
/// caller without a reply.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    identity: &ServerIdentity,
) -> Result<SessionCipher> {
    let peer_key_bytes = read_frame(stream).await?;
    let peer_key: [u8; 32] = peer_key_bytes
        .try_into()
        .map_err(|_| TransportError::Crypto("peer public key must be 32 bytes".to_string()))?;
    if !identity.accepted_client_keys.contains(&peer_key) {
        return Err(TransportError::Connection(
            "peer public key is not in the accepted clients directory".to_string(),
        ));
    }
    let peer_public = X25519PublicKey::from_bytes(peer_key);
    let shared = identity.secret.diffie_hellman(&peer_public);
    let (send_key, recv_key) = derive_session_keys(shared, false);
    Ok(SessionCipher::new(send_key, recv_key))
}

/// Client-side handshake: send our public key and derive the session
/// cipher against the known server public key.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    identity: &ClientIdentity,
) -> Result<SessionCipher> {
    let our_public = identity.secret.public_key().to_bytes();
    write_frame(stream, &our_public).await?;
    let shared = identity.secret.diffie_hellman(&identity.server_public);
    let (send_key, recv_key) = derive_session_keys(shared, true);
    Ok(SessionCipher::new(send_key, recv_key))
}

/// Write a 32-byte key to a file as a single hex-encoded line.
pub fn write_key_file(path: &Path, bytes: &[u8; 32]) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", hex::encode(bytes)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Read a 32-byte hex-encoded key file written by [`write_key_file`].
pub fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TransportError::Crypto(format!("reading key file {}: {e}", path.display())))?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| TransportError::Crypto(format!("key file {} is not valid hex: {e}", path.display())))?;
    bytes
        .try_into()
        .map_err(|_| TransportError::Crypto(format!("key file {} is not 32 bytes", path.display())))
}

/// Load every `*.key` file in a directory as an accepted client public key.
pub fn load_accepted_keys(dir: &Path) -> Result<HashSet<[u8; 32]>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TransportError::Crypto(format!("reading clients directory {}: {e}", dir.display())))?;
    let mut keys = HashSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| TransportError::Crypto(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("key") {
            keys.insert(read_key_file(&path)?);
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffie_hellman_agreement() {
        let alice = X25519StaticSecret::random();
        let bob = X25519StaticSecret::random();
        let shared_a = alice.diffie_hellman(&bob.public_key());
        let shared_b = bob.diffie_hellman(&alice.public_key());
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn directional_keys_are_swapped_between_roles() {
        let shared = [7u8; 32];
        let (client_send, client_recv) = derive_session_keys(shared, true);
        let (server_send, server_recv) = derive_session_keys(shared, false);
        assert_eq!(client_send, server_recv);
        assert_eq!(client_recv, server_send);
        assert_ne!(client_send, client_recv);
    }

    #[test]
    fn seal_open_roundtrip() {
        let (send, recv) = ([1u8; 32], [2u8; 32]);
        let mut a = SessionCipher::new(send, recv);
        let mut b = SessionCipher::new(recv, send);
        let ct = a.seal(b"hello").unwrap();
        let pt = b.open(&ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let (send, recv) = ([1u8; 32], [2u8; 32]);
        let mut a = SessionCipher::new(send, recv);
        let mut b = SessionCipher::new(recv, send);
        let mut ct = a.seal(b"hello").unwrap();
        ct[0] ^= 0xff;
        assert!(b.open(&ct).is_err());
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("posttroll-test-{:x}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("alice.key");
        write_key_file(&path, &[9u8; 32]).unwrap();
        let read_back = read_key_file(&path).unwrap();
        assert_eq!(read_back, [9u8; 32]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn handshake_succeeds_for_accepted_client() {
        let server_secret = X25519StaticSecret::random();
        let client_secret = X25519StaticSecret::random();
        let mut accepted = HashSet::new();
        accepted.insert(client_secret.public_key().to_bytes());

        let (mut client_stream, mut server_stream) = tokio::io::duplex(256);
        let client_identity = ClientIdentity {
            secret: client_secret,
            server_public: server_secret.public_key(),
        };
        let server_identity = ServerIdentity {
            secret: server_secret,
            accepted_client_keys: accepted,
        };

        let client_fut = client_handshake(&mut client_stream, &client_identity);
        let server_fut = server_handshake(&mut server_stream, &server_identity);
        let (client_cipher, server_cipher) = tokio::join!(client_fut, server_fut);
        let mut client_cipher = client_cipher.unwrap();
        let mut server_cipher = server_cipher.unwrap();

        let ct = client_cipher.seal(b"ping").unwrap();
        assert_eq!(server_cipher.open(&ct).unwrap(), b"ping");
    }

    #[tokio::test]
    async fn handshake_rejects_unlisted_client() {
        let server_secret = X25519StaticSecret::random();
        let client_secret = X25519StaticSecret::random();
        let other_secret = X25519StaticSecret::random();
        let mut accepted = HashSet::new();
        accepted.insert(other_secret.public_key().to_bytes());

        let (mut client_stream, mut server_stream) = tokio::io::duplex(256);
        let client_identity = ClientIdentity {
            secret: client_secret,
            server_public: server_secret.public_key(),
        };
        let server_identity = ServerIdentity {
            secret: server_secret,
            accepted_client_keys: accepted,
        };

        let client_fut = client_handshake(&mut client_stream, &client_identity);
        let server_fut = server_handshake(&mut server_stream, &server_identity);
        let (_client_cipher, server_result) = tokio::join!(client_fut, server_fut);
        assert!(matches!(server_result, Err(TransportError::Connection(_))));
    }
}
