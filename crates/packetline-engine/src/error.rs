use std::sync::Arc;

use packetline_codec::CodecError;
use packetline_transport::TransportError;

use crate::dispatch::{BoxError, Priority, Stage};
use crate::event::LoopKind;

/// A listener or handler failed while a packet was being delivered.
#[derive(Debug, thiserror::Error)]
#[error("{stage} at {priority} priority failed on {packet}: {source}")]
pub struct DispatchError {
    pub priority: Priority,
    pub stage: Stage,
    /// Debug rendering of the packet being delivered.
    pub packet: String,
    pub source: BoxError,
    /// Further listener errors at the same level that were logged but not returned.
    pub suppressed: usize,
}

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Decoding failed, or the transport failed underneath the codec.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A packet of an outbound batch could not be encoded or written.
    #[error("failed to write {packet} ({written} of {attempted} written): {source}")]
    Send {
        attempted: usize,
        written: usize,
        packet: &'static str,
        source: CodecError,
    },

    /// Delivery of an inbound packet failed.
    #[error("failed to handle packet {index}/{count}: {source}")]
    Dispatch {
        index: usize,
        count: usize,
        source: DispatchError,
    },

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is not running")]
    NotRunning,

    #[error("engine was stopped and cannot be restarted")]
    Terminated,

    #[error("failed to spawn {kind} thread: {source}")]
    Spawn {
        kind: LoopKind,
        source: std::io::Error,
    },

    /// A worker loop terminated with an error (strict mode).
    #[error("{kind} loop failed: {source}")]
    LoopFailed {
        kind: LoopKind,
        source: Arc<EngineError>,
    },

    #[error("{kind} loop panicked")]
    LoopPanicked { kind: LoopKind },
}

impl EngineError {
    /// Whether this is a per-packet failure the stream can recover from.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Codec(err) => err.is_recoverable(),
            // Part of a frame may already be on the wire.
            Self::Send {
                source: CodecError::Transport(_),
                ..
            } => false,
            Self::Send { .. } | Self::Dispatch { .. } => true,
            _ => false,
        }
    }

    /// The transport failure underneath a read or write, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Codec(CodecError::Transport(err))
            | Self::Send {
                source: CodecError::Transport(err),
                ..
            } => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
