//! Typed binary packets over any byte stream.
//!
//! packetline frames application packets as `[type id: u16][length: u16][payload]`,
//! moves them through a threaded read/write engine, delivers them by priority
//! to listeners and handlers, and correlates acknowledged requests with their
//! responses.
//!
//! # Crate Structure
//!
//! - [`transport`]: duplex byte channels (TCP, in-memory loopback)
//! - [`codec`]: packet traits, type registry, frame encoding and decoding
//! - [`engine`]: read/write worker threads, queues and the priority dispatcher
//! - [`ack`]: request/response correlation with retransmission
//! - [`demo`]: the chat and counter packets used by the CLI and examples

/// Re-export transport types.
pub mod transport {
    pub use packetline_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use packetline_codec::*;
}

/// Re-export engine types.
pub mod engine {
    pub use packetline_engine::*;
}

/// Re-export acknowledged exchange types.
pub mod ack {
    pub use packetline_ack::*;
}

pub mod demo;
