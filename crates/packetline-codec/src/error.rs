use crate::packet::PacketId;

/// Errors that can occur while encoding, decoding or registering packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A payload reader consumed a different number of bytes than the header declared.
    #[error("packet {id} declared {declared} payload bytes but the reader consumed {consumed}")]
    PayloadMismatch {
        id: PacketId,
        declared: usize,
        consumed: usize,
    },

    /// A payload writer emitted a different number of bytes than `payload_size` reported.
    #[error("{packet} declared {declared} payload bytes but wrote {written}")]
    SizeMismatch {
        packet: &'static str,
        declared: usize,
        written: usize,
    },

    /// A payload field could not be encoded or decoded.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// The decoded type ID has no registry entry.
    #[error("unknown packet type {id} ({length} payload bytes skipped)")]
    UnknownType { id: PacketId, length: usize },

    /// The packet type was never registered, so it has no wire ID.
    #[error("packet type {0} is not registered")]
    UnregisteredType(&'static str),

    /// Two registrations used the same type ID.
    #[error("packet id {id} is already registered to {existing}")]
    DuplicateId { id: PacketId, existing: &'static str },

    /// The same packet type was registered twice.
    #[error("packet type {0} is already registered")]
    DuplicateType(&'static str),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] packetline_transport::TransportError),
}

impl CodecError {
    /// Whether the byte stream is still aligned on a frame boundary after this error.
    ///
    /// Recoverable errors concern a single packet whose frame was consumed whole;
    /// the next frame can be decoded normally. Anything else leaves the stream in
    /// an unknown position and is fatal to the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownType { .. }
                | Self::PayloadMismatch { .. }
                | Self::Payload(_)
                | Self::SizeMismatch { .. }
                | Self::UnregisteredType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
