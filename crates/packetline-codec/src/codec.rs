use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{CodecError, Result};
use crate::packet::{Packet, PacketId, Role};
use crate::payload::{PayloadReader, PayloadWriter};
use crate::registry::PacketRegistry;

/// Frame header: type id (2) + payload length (2) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Byte order for every multi-byte header and payload field on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Configuration for the packet codec.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Byte order of header and payload fields. Default: big-endian.
    pub endianness: Endianness,
    /// Which side of ack exchanges this endpoint is. Default: client.
    pub role: Role,
    /// Maximum accepted payload size, capped at [`MAX_PAYLOAD`].
    pub max_payload_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            endianness: Endianness::Big,
            role: Role::Client,
            max_payload_size: MAX_PAYLOAD,
        }
    }
}

/// Read the `(type id, payload length)` header at the front of `src` without
/// consuming it. Returns `None` when fewer than [`HEADER_SIZE`] bytes are buffered.
pub fn peek_header(src: &[u8], endianness: Endianness) -> Option<(PacketId, usize)> {
    if src.len() < HEADER_SIZE {
        return None;
    }
    let id = [src[0], src[1]];
    let len = [src[2], src[3]];
    Some(match endianness {
        Endianness::Big => (u16::from_be_bytes(id), usize::from(u16::from_be_bytes(len))),
        Endianness::Little => (u16::from_le_bytes(id), usize::from(u16::from_le_bytes(len))),
    })
}

/// Encodes registered packets into frames and decodes frames back into packets.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Type ID (2B) │ Length (2B)  │ Payload             │
/// │              │              │ (Length bytes)      │
/// └──────────────┴──────────────┴─────────────────────┘
/// ```
/// Both header fields use the configured [`Endianness`].
#[derive(Debug, Clone)]
pub struct PacketCodec {
    registry: Arc<PacketRegistry>,
    config: CodecConfig,
}

impl PacketCodec {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self::with_config(registry, CodecConfig::default())
    }

    pub fn with_config(registry: Arc<PacketRegistry>, config: CodecConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    fn max_payload(&self) -> usize {
        self.config.max_payload_size.min(MAX_PAYLOAD)
    }

    /// Append one framed packet to `dst`.
    ///
    /// On error `dst` is left exactly as it was.
    pub fn encode(&self, packet: &dyn Packet, dst: &mut BytesMut) -> Result<()> {
        let id = self
            .registry
            .id_of(packet)
            .ok_or(CodecError::UnregisteredType(packet.type_name()))?;

        let declared = packet.payload_size();
        let max = self.max_payload();
        if declared > max {
            return Err(CodecError::PayloadTooLarge {
                size: declared,
                max,
            });
        }

        let start = dst.len();
        dst.reserve(HEADER_SIZE + declared);
        // `declared` fits in 16 bits: it is bounded by MAX_PAYLOAD above.
        let length = declared as u16;
        match self.config.endianness {
            Endianness::Big => {
                dst.put_u16(id);
                dst.put_u16(length);
            }
            Endianness::Little => {
                dst.put_u16_le(id);
                dst.put_u16_le(length);
            }
        }

        let mut out = PayloadWriter::new(dst, self.config.endianness);
        let result = packet.write_payload(&mut out);
        let written = out.written();

        if let Err(err) = result {
            dst.truncate(start);
            return Err(err);
        }
        if written != declared {
            dst.truncate(start);
            return Err(CodecError::SizeMismatch {
                packet: packet.type_name(),
                declared,
                written,
            });
        }

        trace!(id, length = declared, "encoded packet");
        Ok(())
    }

    /// Encode one packet into a standalone frame.
    pub fn encode_to_bytes(&self, packet: &dyn Packet) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + packet.payload_size());
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when the header or payload is
    /// not fully buffered yet. A length above the configured maximum is returned as
    /// [`CodecError::PayloadTooLarge`], also without consuming, since the stream
    /// position can no longer be trusted. Every other error consumes exactly the
    /// offending frame, leaving `src` at the next frame boundary.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Box<dyn Packet>>> {
        let Some((id, length)) = peek_header(src, self.config.endianness) else {
            return Ok(None); // Need more data
        };

        let max = self.max_payload();
        if length > max {
            return Err(CodecError::PayloadTooLarge { size: length, max });
        }
        if src.len() < HEADER_SIZE + length {
            return Ok(None); // Need more data
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        let mut packet = self
            .registry
            .create(id)
            .ok_or(CodecError::UnknownType { id, length })?;

        if let Some(ack) = packet.as_ack_mut() {
            ack.set_destination(self.config.role.inbound_direction());
        }

        let mut input = PayloadReader::new(payload, self.config.endianness, id);
        packet.read_payload(&mut input)?;
        input.finish()?;

        trace!(id, length, "decoded packet");
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{AckPacket, CorrelationKey, Direction};
    use crate::payload::str_size;

    #[derive(Debug, Default, PartialEq)]
    struct Chat {
        message: String,
    }

    impl Packet for Chat {
        fn payload_size(&self) -> usize {
            str_size(&self.message)
        }
        fn write_payload(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
            out.put_str(&self.message)
        }
        fn read_payload(&mut self, input: &mut PayloadReader) -> Result<()> {
            self.message = input.get_str()?;
            Ok(())
        }
    }

    /// Claims more payload than it writes.
    #[derive(Debug, Default)]
    struct Liar;

    impl Packet for Liar {
        fn payload_size(&self) -> usize {
            3
        }
        fn write_payload(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
            out.put_u8(1);
            Ok(())
        }
        fn read_payload(&mut self, input: &mut PayloadReader) -> Result<()> {
            input.get_u8()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Unregistered;

    impl Packet for Unregistered {
        fn payload_size(&self) -> usize {
            0
        }
        fn write_payload(&self, _out: &mut PayloadWriter<'_>) -> Result<()> {
            Ok(())
        }
        fn read_payload(&mut self, _input: &mut PayloadReader) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone)]
    struct Square {
        key: CorrelationKey,
        destination: Direction,
        input: u16,
        output: u32,
    }

    impl AckPacket for Square {
        fn key(&self) -> CorrelationKey {
            self.key
        }
        fn set_key(&mut self, key: CorrelationKey) {
            self.key = key;
        }
        fn destination(&self) -> Direction {
            self.destination
        }
        fn set_destination(&mut self, destination: Direction) {
            self.destination = destination;
        }
        fn payload_size_to_server(&self) -> usize {
            2
        }
        fn payload_size_to_client(&self) -> usize {
            4
        }
        fn write_to_server(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
            out.put_u16(self.input);
            Ok(())
        }
        fn write_to_client(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
            out.put_u32(self.output);
            Ok(())
        }
        fn read_from_client(&mut self, input: &mut PayloadReader) -> Result<()> {
            self.input = input.get_u16()?;
            Ok(())
        }
        fn read_from_server(&mut self, input: &mut PayloadReader) -> Result<()> {
            self.output = input.get_u32()?;
            Ok(())
        }
    }

    crate::ack_packet!(Square);

    fn registry() -> Arc<PacketRegistry> {
        PacketRegistry::builder()
            .register::<Chat>(1)
            .unwrap()
            .register::<Square>(2)
            .unwrap()
            .register::<Liar>(3)
            .unwrap()
            .build()
    }

    fn codec_with(endianness: Endianness, role: Role) -> PacketCodec {
        PacketCodec::with_config(
            registry(),
            CodecConfig {
                endianness,
                role,
                ..CodecConfig::default()
            },
        )
    }

    fn chat(message: &str) -> Chat {
        Chat {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_wire_layout_big_endian() {
        let codec = PacketCodec::new(registry());
        let bytes = codec.encode_to_bytes(&chat("hi")).unwrap();
        assert_eq!(bytes.as_ref(), &[0x00, 0x01, 0x00, 0x04, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_wire_layout_little_endian() {
        let codec = codec_with(Endianness::Little, Role::Client);
        let bytes = codec.encode_to_bytes(&chat("hi")).unwrap();
        assert_eq!(bytes.as_ref(), &[0x01, 0x00, 0x04, 0x00, 0x02, 0x00, b'h', b'i']);
    }

    #[test]
    fn test_encode_decode_chat() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        codec.encode(&chat("hello, packetline!"), &mut buf).unwrap();

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.downcast_ref::<Chat>(), Some(&chat("hello, packetline!")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        codec.encode(&chat("hello"), &mut buf).unwrap();
        let full = buf.len();
        buf.truncate(full - 2);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), full - 2);
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        codec.encode(&chat("first"), &mut buf).unwrap();
        codec.encode(&chat("second"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.downcast_ref::<Chat>().unwrap().message, "first");
        assert_eq!(second.downcast_ref::<Chat>().unwrap().message, "second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_consumes_frame_and_recovers() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        buf.put_u16(99);
        buf.put_u16(3);
        buf.put_slice(b"xyz");
        codec.encode(&chat("after"), &mut buf).unwrap();

        let err = codec.decode(&mut buf).err().unwrap();
        assert!(matches!(err, CodecError::UnknownType { id: 99, length: 3 }));
        assert!(err.is_recoverable());

        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.downcast_ref::<Chat>().unwrap().message, "after");
    }

    #[test]
    fn test_payload_longer_than_reader_consumes() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        // Liar's reader takes one byte; the frame carries two.
        buf.put_u16(3);
        buf.put_u16(2);
        buf.put_slice(&[1, 2]);

        let err = codec.decode(&mut buf).err().unwrap();
        assert!(matches!(
            err,
            CodecError::PayloadMismatch {
                id: 3,
                declared: 2,
                consumed: 1
            }
        ));
        assert!(err.is_recoverable());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_too_large_is_fatal_and_unconsumed() {
        let codec = PacketCodec::with_config(
            registry(),
            CodecConfig {
                max_payload_size: 16,
                ..CodecConfig::default()
            },
        );
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(1024);

        let err = codec.decode(&mut buf).err().unwrap();
        assert!(matches!(err, CodecError::PayloadTooLarge { size: 1024, max: 16 }));
        assert!(!err.is_recoverable());
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = PacketCodec::with_config(
            registry(),
            CodecConfig {
                max_payload_size: 4,
                ..CodecConfig::default()
            },
        );
        let mut buf = BytesMut::new();
        let err = codec.encode(&chat("too long"), &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_size_mismatch_leaves_buffer_untouched() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = codec.encode(&Liar, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::SizeMismatch {
                declared: 3,
                written: 1,
                ..
            }
        ));
        assert_eq!(buf.as_ref(), b"keep");
    }

    #[test]
    fn test_encode_unregistered_type() {
        let codec = PacketCodec::new(registry());
        let mut buf = BytesMut::new();
        let err = codec.encode(&Unregistered, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredType(name) if name.ends_with("Unregistered")));
    }

    #[test]
    fn test_ack_request_decoded_by_server() {
        let client = codec_with(Endianness::Big, Role::Client);
        let server = codec_with(Endianness::Big, Role::Server);

        let request = Square {
            key: 41,
            destination: Direction::ToServer,
            input: 12,
            output: 0,
        };
        let mut wire = BytesMut::new();
        client.encode(&request, &mut wire).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + 4 + 2);

        let decoded = server.decode(&mut wire).unwrap().unwrap();
        let decoded = decoded.downcast_ref::<Square>().unwrap();
        assert_eq!(decoded.key, 41);
        assert_eq!(decoded.destination, Direction::ToServer);
        assert_eq!(decoded.input, 12);
    }

    #[test]
    fn test_ack_response_decoded_by_client() {
        let client = codec_with(Endianness::Little, Role::Client);
        let server = codec_with(Endianness::Little, Role::Server);

        let response = Square {
            key: 41,
            destination: Direction::ToClient,
            input: 0,
            output: 144,
        };
        let mut wire = BytesMut::new();
        server.encode(&response, &mut wire).unwrap();

        let decoded = client.decode(&mut wire).unwrap().unwrap();
        let decoded = decoded.as_ack().unwrap();
        assert_eq!(decoded.key(), 41);
        assert_eq!(decoded.destination(), Direction::ToClient);
    }

    #[test]
    fn test_ack_shape_mismatch_between_roles_is_detected() {
        // A client decoding a request expects the 4-byte response shape.
        let client = codec_with(Endianness::Big, Role::Client);
        let request = Square::default();
        let mut wire = BytesMut::new();
        client.encode(&request, &mut wire).unwrap();

        let err = client.decode(&mut wire).err().unwrap();
        assert!(matches!(err, CodecError::PayloadMismatch { id: 2, .. }));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_peek_header() {
        assert_eq!(peek_header(&[0x00, 0x02, 0x01, 0x00], Endianness::Big), Some((2, 256)));
        assert_eq!(peek_header(&[0x02, 0x00, 0x01, 0x00], Endianness::Little), Some((2, 1)));
        assert_eq!(peek_header(&[0x00, 0x02, 0x01], Endianness::Big), None);
    }

    #[test]
    fn test_empty_payload() {
        let registry = PacketRegistry::builder()
            .register::<Unregistered>(0)
            .unwrap()
            .build();
        let codec = PacketCodec::new(registry);
        let bytes = codec.encode_to_bytes(&Unregistered).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let mut buf = BytesMut::from(bytes.as_ref());
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert!(packet.is::<Unregistered>());
    }
}
