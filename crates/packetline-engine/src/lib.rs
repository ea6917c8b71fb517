//! Concurrent packet I/O and priority dispatch.
//!
//! A [`PacketEngine`] owns an inbound and an outbound packet queue and runs two
//! worker threads against a [`Transport`](packetline_transport::Transport):
//! the read loop decodes frames into the inbound queue, the write loop encodes
//! queued packets onto the wire. Neither loop ever delivers packets; the owner
//! calls [`PacketEngine::process_inbound_queue`] from its own thread, which
//! hands each packet to the [`Dispatcher`] in strict priority order.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod queue;

pub use config::EngineConfig;
pub use dispatch::{BoxError, Dispatcher, Handler, Listener, Priority, Registration, Stage};
pub use engine::{EngineState, PacketEngine};
pub use error::{DispatchError, EngineError, Result};
pub use event::{EngineEvent, LoopKind};
pub use queue::{OutboundQueue, PacketQueue};
