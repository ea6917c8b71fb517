use bytes::BytesMut;
use packetline_transport::Transport;
use tracing::trace;

use crate::codec::PacketCodec;
use crate::error::Result;
use crate::packet::Packet;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Encodes packets and writes each frame to a [`Transport`] in one call.
///
/// The encode buffer is reused between packets.
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Encode and write one packet. Returns the frame size in bytes.
    ///
    /// Encoding errors leave the transport untouched.
    pub fn write_packet(
        &mut self,
        transport: &dyn Transport,
        codec: &PacketCodec,
        packet: &dyn Packet,
    ) -> Result<usize> {
        self.buf.clear();
        codec.encode(packet, &mut self.buf)?;
        transport.write_bytes(&self.buf)?;
        trace!(
            transport = transport.name(),
            bytes = self.buf.len(),
            "wrote packet"
        );
        Ok(self.buf.len())
    }
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}
