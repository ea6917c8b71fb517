use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `connect` was called on a transport that is already connected.
    #[error("transport already connected")]
    AlreadyConnected,

    /// The operation requires a connected transport.
    #[error("transport not connected")]
    NotConnected,

    /// The transport has been disposed and cannot be used again.
    #[error("transport disposed")]
    Disposed,

    /// The transport has no address to dial (it was built from an accepted stream).
    #[error("transport cannot reconnect: no remote address")]
    NotReconnectable,

    /// Fewer bytes are buffered than a `read_exact` call asked for.
    #[error("insufficient data ({requested} bytes requested, {available} available)")]
    InsufficientData { requested: usize, available: usize },

    /// The remote end closed the stream.
    #[error("transport closed by peer")]
    Closed,
}

impl TransportError {
    /// Returns true for programmer errors about connection state
    /// (connect-when-connected, disconnect-when-disconnected, use-after-dispose).
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConnected | Self::NotConnected | Self::Disposed | Self::NotReconnectable
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
