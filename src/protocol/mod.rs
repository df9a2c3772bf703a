//! MQTT 3.1.1 wire protocol.
//!
//! [`codec`] holds the encoding primitives, [`v4`] the 14 control packet
//! types. This module adds the async glue for reading and writing packets
//! over any `AsyncRead`/`AsyncWrite` transport.

pub mod codec;
pub mod v4;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub use v4::Packet;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single MQTT packet from an async reader.
///
/// Bytes already buffered in `buf` are consumed first; the buffer may end
/// up holding the prefix of the next packet.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok((packet, consumed)) => {
                    let _ = buf.split_to(consumed);
                    return Ok(packet);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single MQTT packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = vec![0u8; packet.size()];
    let written = packet.write(&mut buf)?;
    writer.write_all(&buf[..written]).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let packet = Packet::Publish(v4::Publish {
            topic: "x/y".to_string(),
            payload: bytes::Bytes::from_static(b"hi"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 3,
        });

        write_packet(&mut a, &packet).await.unwrap();
        write_packet(&mut a, &Packet::PingReq).await.unwrap();

        let mut buf = BytesMut::new();
        let first = read_packet(&mut b, &mut buf, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(first, packet);
        let second = read_packet(&mut b, &mut buf, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(second, Packet::PingReq);
    }

    #[tokio::test]
    async fn test_read_packet_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let mut buf = BytesMut::new();
        let err = read_packet(&mut b, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
