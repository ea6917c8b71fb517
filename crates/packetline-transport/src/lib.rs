//! Duplex byte channel abstraction.
//!
//! The packet stack treats anything that can report how many bytes are
//! waiting, hand those bytes over without blocking, and accept bytes for
//! writing as an interchangeable [`Transport`]:
//! - TCP sockets ([`TcpTransport`], accepted via [`TcpAcceptor`])
//! - In-memory loopback pairs ([`LoopbackTransport`]) for tests and demos
//!
//! This is the lowest layer of packetline. Connection lifetime belongs to
//! the caller; nothing above this crate reconnects on its own.

pub mod error;
pub mod loopback;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::LoopbackTransport;
pub use tcp::{TcpAcceptor, TcpConfig, TcpTransport};
pub use traits::Transport;
