use std::any::Any;
use std::fmt;

use crate::error::Result;
use crate::payload::{PayloadReader, PayloadWriter};

/// Wire type identifier of a registered packet type.
pub type PacketId = u16;

/// Identifier linking an ack request to its response.
pub type CorrelationKey = u32;

/// Bytes reserved for the correlation key at the start of every ack payload.
pub const KEY_SIZE: usize = 4;

/// Which way an ack packet is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// A request, written by a client and read by a server.
    #[default]
    ToServer,
    /// A response, written by a server and read by a client.
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToServer => f.write_str("to-server"),
            Self::ToClient => f.write_str("to-client"),
        }
    }
}

/// The role an endpoint plays in ack exchanges.
///
/// The role decides which payload shape the endpoint expects when it decodes an
/// ack packet: a client only ever receives responses, a server only requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl Role {
    /// Direction of ack packets this endpoint decodes.
    pub fn inbound_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ToClient,
            Self::Server => Direction::ToServer,
        }
    }

    /// Direction of ack packets this endpoint originates.
    pub fn outbound_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ToServer,
            Self::Server => Direction::ToClient,
        }
    }
}

/// Upcasting support so `dyn Packet` values can be inspected by concrete type.
pub trait AsAny: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A typed message that can be framed onto the wire.
///
/// The wire ID is not part of the type: it is assigned when the type is added to
/// a [`PacketRegistry`](crate::PacketRegistry). `write_payload` must emit exactly
/// `payload_size()` bytes and `read_payload` must consume the whole payload;
/// the codec rejects packets that do not.
pub trait Packet: AsAny + fmt::Debug {
    /// Size in bytes of the payload `write_payload` will produce.
    fn payload_size(&self) -> usize;

    fn write_payload(&self, out: &mut PayloadWriter<'_>) -> Result<()>;

    fn read_payload(&mut self, input: &mut PayloadReader) -> Result<()>;

    /// The ack capability of this packet, if it has one.
    fn as_ack(&self) -> Option<&dyn AckPacket> {
        None
    }

    fn as_ack_mut(&mut self) -> Option<&mut dyn AckPacket> {
        None
    }

    /// Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl dyn Packet {
    /// Whether this packet is a `T`.
    pub fn is<T: Packet>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Packet>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Take ownership of the concrete packet, or `None` if it is not a `T`.
    pub fn downcast<T: Packet>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// A request/response packet.
///
/// A request and its response are the same Rust type with two payload shapes:
/// one written by the client (`*_to_server`, read back with `read_from_client`)
/// and one written by the server (`*_to_client`, read with `read_from_server`).
/// Implement this trait and invoke [`ack_packet!`](crate::ack_packet) to derive
/// the matching [`Packet`] impl, which prefixes both shapes with the key.
pub trait AckPacket: Packet {
    fn key(&self) -> CorrelationKey;
    fn set_key(&mut self, key: CorrelationKey);

    fn destination(&self) -> Direction;
    fn set_destination(&mut self, destination: Direction);

    fn payload_size_to_server(&self) -> usize;
    fn payload_size_to_client(&self) -> usize;

    fn write_to_server(&self, out: &mut PayloadWriter<'_>) -> Result<()>;
    fn write_to_client(&self, out: &mut PayloadWriter<'_>) -> Result<()>;

    fn read_from_client(&mut self, input: &mut PayloadReader) -> Result<()>;
    fn read_from_server(&mut self, input: &mut PayloadReader) -> Result<()>;
}

#[doc(hidden)]
pub fn ack_payload_size<T: AckPacket + ?Sized>(packet: &T) -> usize {
    KEY_SIZE
        + match packet.destination() {
            Direction::ToServer => packet.payload_size_to_server(),
            Direction::ToClient => packet.payload_size_to_client(),
        }
}

#[doc(hidden)]
pub fn write_ack_payload<T: AckPacket + ?Sized>(
    packet: &T,
    out: &mut PayloadWriter<'_>,
) -> Result<()> {
    out.put_u32(packet.key());
    match packet.destination() {
        Direction::ToServer => packet.write_to_server(out),
        Direction::ToClient => packet.write_to_client(out),
    }
}

#[doc(hidden)]
pub fn read_ack_payload<T: AckPacket + ?Sized>(
    packet: &mut T,
    input: &mut PayloadReader,
) -> Result<()> {
    let key = input.get_u32()?;
    packet.set_key(key);
    match packet.destination() {
        Direction::ToServer => packet.read_from_client(input),
        Direction::ToClient => packet.read_from_server(input),
    }
}
