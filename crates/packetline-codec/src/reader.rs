use bytes::BytesMut;
use packetline_transport::Transport;

use crate::codec::{PacketCodec, HEADER_SIZE};
use crate::error::Result;
use crate::packet::Packet;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Accumulates bytes pulled from a [`Transport`] and yields whole packets.
///
/// `fill` never blocks: it only takes what the transport reports as available.
/// Partial frames stay buffered until the rest arrives.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
}

impl PacketReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Move every byte the transport has available into the buffer.
    ///
    /// Returns the number of bytes moved.
    pub fn fill(&mut self, transport: &dyn Transport) -> Result<usize> {
        let available = transport.bytes_available()?;
        if available == 0 {
            return Ok(0);
        }
        let bytes = transport.read_exact(available)?;
        self.buf.extend_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Decode the next buffered packet, if a whole frame is present.
    pub fn next_packet(&mut self, codec: &PacketCodec) -> Result<Option<Box<dyn Packet>>> {
        codec.decode(&mut self.buf)
    }

    /// Fill from the transport, then decode one packet.
    pub fn read_packet(
        &mut self,
        transport: &dyn Transport,
        codec: &PacketCodec,
    ) -> Result<Option<Box<dyn Packet>>> {
        if let Some(packet) = self.next_packet(codec)? {
            return Ok(Some(packet));
        }
        self.fill(transport)?;
        self.next_packet(codec)
    }

    /// Whether at least a full frame header is buffered.
    pub fn has_header(&self) -> bool {
        self.buf.len() >= HEADER_SIZE
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered bytes, e.g. after a connection-fatal error.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}
