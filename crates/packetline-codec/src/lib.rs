//! Typed packet framing for packetline.
//!
//! Every packet travels as a single frame:
//! - A 2-byte packet type ID, assigned when the type is registered
//! - A 2-byte payload length
//! - The payload, exactly `length` bytes, written by the packet type itself
//!
//! Multi-byte fields follow the connection's [`Endianness`] (big-endian unless
//! configured otherwise). Request/response packets implement [`AckPacket`] and
//! carry a correlation key in the first four bytes of either payload shape.

pub mod codec;
pub mod error;
pub mod packet;
pub mod payload;
pub mod reader;
pub mod registry;
pub mod writer;

mod macros;

pub use codec::{peek_header, CodecConfig, Endianness, PacketCodec, HEADER_SIZE, MAX_PAYLOAD};
pub use error::{CodecError, Result};
pub use packet::{AckPacket, AsAny, CorrelationKey, Direction, Packet, PacketId, Role, KEY_SIZE};
pub use payload::{PayloadReader, PayloadWriter};
pub use reader::PacketReader;
pub use registry::{PacketRegistry, PacketRegistryBuilder};
pub use writer::PacketWriter;
