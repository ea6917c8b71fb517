use std::time::Duration;

use packetline_engine::Priority;

/// Retry policy and dispatch placement of an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// How long a request may stay unanswered before it is re-sent. Default: 1 s.
    pub timeout: Duration,
    /// Re-sends allowed before the request fails with a timeout. Default: 3.
    pub max_retries: u32,
    /// Dispatcher level of the exchange's handler. Default: highest.
    pub priority: Priority,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            priority: Priority::Highest,
        }
    }
}
