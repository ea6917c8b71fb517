use packetline_codec::CorrelationKey;

/// Errors that resolve a request, or prevent one from being issued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// No response arrived within the retry budget.
    #[error("request {key} timed out after {retries} retries")]
    Timeout { key: CorrelationKey, retries: u32 },

    /// The owner cancelled the request.
    #[error("request {key} was cancelled")]
    Cancelled { key: CorrelationKey },

    /// A request with this key is already pending.
    #[error("correlation key {0} is already pending")]
    DuplicateKey(CorrelationKey),

    /// The exchange was dropped while the request was pending.
    #[error("request {key} was abandoned before completion")]
    Abandoned { key: CorrelationKey },

    /// The watchdog thread could not be spawned.
    #[error("failed to spawn watchdog thread: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
