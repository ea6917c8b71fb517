//! Demo packet set: a chat message and an acknowledged counter.
//!
//! Both sides of a connection must build their codec from [`registry`] so
//! the type ids agree.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use packetline_ack::{ExchangeConfig, ReliableExchange};
use packetline_codec::payload::str_size;
use packetline_codec::{
    AckPacket, CodecConfig, CodecError, CorrelationKey, Direction, Packet, PacketCodec, PacketId,
    PacketRegistry, PayloadReader, PayloadWriter, Result, Role,
};
use packetline_engine::PacketEngine;
use tracing::debug;

pub const CHAT_ID: PacketId = 1;
pub const COUNTER_ID: PacketId = 2;

/// Amount the counter service moves per increment or decrement.
pub const DEFAULT_STEP: u32 = 200;

/// A free-form text message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatPacket {
    pub message: String,
}

impl ChatPacket {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Packet for ChatPacket {
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

impl fmt::Display for ChatPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat({:?})", self.message)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CounterAction {
    Increment = 0,
    Decrement = 1,
    #[default]
    Get = 2,
}

impl CounterAction {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Increment),
            1 => Ok(Self::Decrement),
            2 => Ok(Self::Get),
            other => Err(CodecError::Payload(format!(
                "invalid counter action {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increment => "incr",
            Self::Decrement => "decr",
            Self::Get => "get",
        }
    }
}

impl fmt::Display for CounterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asks the server to change or report its counter.
///
/// To the server the payload is the action byte; to the client it is the
/// resulting count.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CounterPacket {
    pub key: CorrelationKey,
    pub destination: Direction,
    pub action: CounterAction,
    pub count: u32,
}

impl CounterPacket {
    pub fn request(action: CounterAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    pub fn response(count: u32) -> Self {
        Self {
            destination: Direction::ToClient,
            count,
            ..Self::default()
        }
    }
}

impl AckPacket for CounterPacket {
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
        1
    }

    fn payload_size_to_client(&self) -> usize {
        4
    }

    fn write_to_server(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
        out.put_u8(self.action as u8);
        Ok(())
    }

    fn write_to_client(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
        out.put_u32(self.count);
        Ok(())
    }

    fn read_from_client(&mut self, input: &mut PayloadReader) -> Result<()> {
        self.action = CounterAction::from_u8(input.get_u8()?)?;
        Ok(())
    }

    fn read_from_server(&mut self, input: &mut PayloadReader) -> Result<()> {
        self.count = input.get_u32()?;
        Ok(())
    }
}

packetline_codec::ack_packet!(CounterPacket);

impl fmt::Display for CounterPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "counter({} -> {}: {} -> {})",
            self.key, self.destination, self.action, self.count
        )
    }
}

/// Registry holding the demo packet types.
pub fn registry() -> Result<Arc<PacketRegistry>> {
    Ok(PacketRegistry::builder()
        .register::<ChatPacket>(CHAT_ID)?
        .register::<CounterPacket>(COUNTER_ID)?
        .build())
}

/// Big-endian codec over the demo registry for the given side.
pub fn codec(role: Role) -> Result<PacketCodec> {
    Ok(PacketCodec::with_config(
        registry()?,
        CodecConfig {
            role,
            ..CodecConfig::default()
        },
    ))
}

/// Server-side counter shared by every connection.
#[derive(Debug)]
pub struct CounterService {
    count: AtomicU32,
    step: u32,
}

impl Default for CounterService {
    fn default() -> Self {
        Self::with_step(DEFAULT_STEP)
    }
}

impl CounterService {
    pub fn with_step(step: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            step,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Apply `action` and return the resulting count. Wraps on overflow.
    pub fn apply(&self, action: CounterAction) -> u32 {
        let step = self.step;
        match action {
            CounterAction::Increment => self.count.fetch_add(step, Ordering::SeqCst).wrapping_add(step),
            CounterAction::Decrement => self.count.fetch_sub(step, Ordering::SeqCst).wrapping_sub(step),
            CounterAction::Get => self.count(),
        }
    }

    /// Answer counter requests arriving on `engine`.
    pub fn serve(
        self: &Arc<Self>,
        engine: &PacketEngine,
        config: ExchangeConfig,
    ) -> ReliableExchange<CounterPacket> {
        let service = Arc::clone(self);
        ReliableExchange::builder(config)
            .processor(move |request: &CounterPacket, responder| {
                let count = service.apply(request.action);
                debug!(key = request.key, action = %request.action, count, "counter request");
                responder.respond(CounterPacket::response(count));
                true
            })
            .attach(engine)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn registry_assigns_demo_ids() {
        let registry = registry().unwrap();
        assert_eq!(registry.id_for::<ChatPacket>(), Some(CHAT_ID));
        assert_eq!(registry.id_for::<CounterPacket>(), Some(COUNTER_ID));
    }

    #[test]
    fn counter_request_wire_layout() {
        let codec = codec(Role::Client).unwrap();
        let mut request = CounterPacket::request(CounterAction::Decrement);
        request.key = 0x0102_0304;
        let mut buf = BytesMut::new();
        codec.encode(&request, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 2, 0, 5, 1, 2, 3, 4, 1]);
    }

    #[test]
    fn server_decodes_request_client_decodes_response() {
        let client = codec(Role::Client).unwrap();
        let server = codec(Role::Server).unwrap();

        let mut buf = BytesMut::new();
        let mut request = CounterPacket::request(CounterAction::Increment);
        request.key = 9;
        client.encode(&request, &mut buf).unwrap();
        let decoded = server.decode(&mut buf).unwrap().unwrap();
        let decoded = decoded.downcast_ref::<CounterPacket>().unwrap();
        assert_eq!(decoded.action, CounterAction::Increment);
        assert_eq!(decoded.destination, Direction::ToServer);

        let mut response = CounterPacket::response(400);
        response.key = 9;
        server.encode(&response, &mut buf).unwrap();
        let decoded = client.decode(&mut buf).unwrap().unwrap();
        let decoded = decoded.downcast_ref::<CounterPacket>().unwrap();
        assert_eq!(decoded.count, 400);
        assert_eq!(decoded.key, 9);
    }

    #[test]
    fn invalid_action_is_a_payload_error() {
        assert!(matches!(
            CounterAction::from_u8(7),
            Err(CodecError::Payload(_))
        ));
    }

    #[test]
    fn chat_round_trips_unicode() {
        let codec = codec(Role::Client).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(&ChatPacket::new("héllo ✓"), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded.downcast_ref::<ChatPacket>(),
            Some(&ChatPacket::new("héllo ✓"))
        );
    }

    #[test]
    fn counter_service_steps_and_wraps() {
        let service = CounterService::default();
        assert_eq!(service.apply(CounterAction::Increment), 200);
        assert_eq!(service.apply(CounterAction::Increment), 400);
        assert_eq!(service.apply(CounterAction::Decrement), 200);
        assert_eq!(service.apply(CounterAction::Get), 200);

        let service = CounterService::with_step(5);
        assert_eq!(service.apply(CounterAction::Decrement), u32::MAX - 4);
    }
}
