//! Reliable request/response exchanges for ack packets.
//!
//! A [`ReliableExchange`] is attached to a [`PacketEngine`](packetline_engine::PacketEngine)
//! for one [`AckPacket`](packetline_codec::AckPacket) type. On the client side,
//! [`ReliableExchange::request`] stamps a fresh correlation key, records the
//! request as pending and returns a [`ResponseHandle`]. On the server side, the
//! exchange's dispatcher handler runs a processor that answers through a
//! [`Responder`]. A watchdog re-sends requests that were not answered in time
//! and fails them once the retry budget is spent.

pub mod config;
pub mod error;
pub mod exchange;
pub mod handle;
mod pending;
pub mod watchdog;

pub use config::ExchangeConfig;
pub use error::{ExchangeError, Result};
pub use exchange::{ReliableExchange, ReliableExchangeBuilder, Responder, TimeoutReport};
pub use handle::ResponseHandle;
pub use watchdog::WatchdogGuard;
