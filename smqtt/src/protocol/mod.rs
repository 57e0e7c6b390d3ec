//! Wire protocol: frame codec, packet model and async frame I/O.

pub mod codec;
pub mod packet;

pub use packet::{ConnAck, Connect, Packet, Publish, SubAck, Subscribe, Unsubscribe};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name carried by CONNECT.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Read a single packet from an async reader.
///
/// Bytes past the returned frame stay in `buf` for the next call.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok((packet, consumed)) => {
                    buf.advance(consumed);
                    trace!("Read {} ({} bytes)", packet.packet_type(), consumed);
                    return Ok(packet);
                }
                Err(Error::Incomplete { .. }) => {}
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

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet.write(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    trace!("Wrote {} ({} bytes)", packet.packet_type(), buf.len());
    Ok(())
}
