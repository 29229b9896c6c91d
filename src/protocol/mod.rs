//! Wire protocol: framing and metadata messages.
//!
//! Three framings share the tunnel:
//! - length-prefixed metadata (`u32` little-endian length ‖ payload) for
//!   connection, stream and service metadata, each with its own size cap
//! - varint-prefixed messages for payment transactions
//! - UDP control datagrams marked by [`PREFIX_LEN`] zero bytes

mod metadata;

pub use metadata::{conn_key, ConnKey, ConnectionMetadata, ServiceMetadata, StreamMetadata};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Maximum serialized size of a [`ConnectionMetadata`].
pub const MAX_CONN_METADATA_SIZE: usize = 1024;

/// Maximum serialized size of a [`StreamMetadata`].
pub const MAX_STREAM_METADATA_SIZE: usize = 1024;

/// Maximum serialized size of a [`ServiceMetadata`].
pub const MAX_SERVICE_METADATA_SIZE: usize = 4096;

/// Maximum serialized size of a nano-pay transaction.
pub const MAX_NANO_PAY_TXN_SIZE: usize = 4096;

/// Number of leading zero bytes marking a UDP control datagram.
pub const PREFIX_LEN: usize = 2;

/// Buffer size used by the tunnel data pumps.
pub const PIPE_BUFFER_SIZE: usize = 4096;

/// Write a length-prefixed frame: `u32` little-endian length ‖ payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(ProtocolError::MetadataTooLarge {
            size: payload.len(),
            max,
        }
        .into());
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting empty or oversized payloads.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyMetadata.into());
    }
    if len > max {
        return Err(ProtocolError::MetadataTooLarge { size: len, max }.into());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a varint-length-prefixed message (LEB128 length ‖ bytes).
pub async fn write_var_bytes<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(ProtocolError::MetadataTooLarge {
            size: payload.len(),
            max,
        }
        .into());
    }
    let mut prefix = [0u8; 10];
    let mut n = payload.len() as u64;
    let mut i = 0;
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        prefix[i] = byte;
        i += 1;
        if n == 0 {
            break;
        }
    }
    writer.write_all(&prefix[..i]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a varint-length-prefixed message.
pub async fn read_var_bytes<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::MalformedVarint.into());
        }
    }
    let len = len as usize;
    if len > max {
        return Err(ProtocolError::MetadataTooLarge { size: len, max }.into());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write the metadata that opens every multiplexed stream.
pub async fn write_stream_metadata<W>(writer: &mut W, meta: &StreamMetadata) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &meta.encode()?, MAX_STREAM_METADATA_SIZE).await
}

/// Read the metadata that opens every multiplexed stream.
pub async fn read_stream_metadata<R>(reader: &mut R) -> Result<StreamMetadata>
where
    R: AsyncRead + Unpin,
{
    StreamMetadata::decode(&read_frame(reader, MAX_STREAM_METADATA_SIZE).await?)
}

/// Encode a local tunnel port as the connection id carried in UDP payloads.
pub fn port_to_conn_id(port: u16) -> [u8; 2] {
    port.to_le_bytes()
}

/// Decode a connection id back to the local tunnel port.
pub fn conn_id_to_port(data: [u8; 2]) -> u16 {
    u16::from_le_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b"hello", 1024).await.unwrap();
        let frame = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_frame_little_endian_prefix() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &[0xaa; 5], 1024).await.unwrap();

        let mut raw = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw, [5, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_frame_rejects_oversize() {
        let (mut client, mut server) = tokio::io::duplex(65536);
        let payload = vec![0u8; 2048];
        assert!(write_frame(&mut client, &payload, 1024).await.is_err());

        // A hostile peer announcing an oversized frame is rejected on read.
        tokio::io::AsyncWriteExt::write_all(&mut client, &8192u32.to_le_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_rejects_empty() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &0u32.to_le_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_var_bytes_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(65536);
        let payload = vec![7u8; 300];
        write_var_bytes(&mut client, &payload, 4096).await.unwrap();
        let read = read_var_bytes(&mut server, 4096).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_var_bytes_cap() {
        let (mut client, mut server) = tokio::io::duplex(65536);
        // length 5000 as varint: 0x88 0x27
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x88, 0x27])
            .await
            .unwrap();
        assert!(read_var_bytes(&mut server, 4096).await.is_err());
    }

    #[test]
    fn test_conn_id() {
        assert_eq!(conn_id_to_port(port_to_conn_id(30020)), 30020);
        // Tunnel ports have a non-zero low byte, which keeps user payloads
        // out of the zero-prefix control namespace under LE encoding.
        assert_ne!(port_to_conn_id(30020)[0], 0);
    }
}
