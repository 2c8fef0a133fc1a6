//! Length-prefixed message framing shared by every TCP-based socket type.
//!
//! Wire format: `[length:4 LE][body:length]`, the same convention used
//! throughout this workspace's QUIC-stream predecessor, applied here to
//! plain `tokio::net::TcpStream`s.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, TransportError};

/// Maximum frame body size accepted on read (16 MiB); guards against a
/// corrupt or hostile length prefix causing an unbounded allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        TransportError::InvalidPacket("frame too large for 4-byte length prefix".to_string())
    })?;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    writer
        .write_all(body)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::InvalidPacket(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, b"hello").await.unwrap();
        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn roundtrip_empty_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"").await.unwrap();
        let got = read_frame(&mut server).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus_len = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&bogus_len.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidPacket(_)));
    }
}
