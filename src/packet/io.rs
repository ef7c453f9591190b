//! Async framing of control packets over a byte stream

use super::{Packet, PacketError};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on an inbound packet's remaining length
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Reads whole control packets from an [`AsyncRead`]
///
/// Bytes that arrive beyond the current packet stay buffered for the next
/// call, so `read_packet` is cancel safe when raced in `tokio::select!`.
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    max_packet_size: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_packet_size(inner, DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(inner: R, max_packet_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Read the next packet, returning [`PacketError::ConnectionClosed`] on EOF
    pub async fn read_packet(&mut self) -> Result<Packet, PacketError> {
        loop {
            if let Some(len) = Packet::peek_remaining_length(&self.buf)? {
                if len > self.max_packet_size {
                    return Err(PacketError::PayloadTooLarge(len));
                }
            }
            if let Some(packet) = Packet::decode(&mut self.buf)? {
                return Ok(packet);
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(PacketError::ConnectionClosed);
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes control packets to an [`AsyncWrite`]
pub struct PacketWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Encode and flush one packet
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), PacketError> {
        self.buf.clear();
        packet.encode(&mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream
    pub async fn shutdown(&mut self) -> Result<(), PacketError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
