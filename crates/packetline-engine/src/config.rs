use std::time::Duration;

/// Tuning knobs for the engine's worker loops.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Packets the write loop takes from the outbound queue per pass. Default: 3.
    pub write_batch_size: usize,
    /// Packets the read loop decodes per pass before yielding. Default: 10.
    pub max_reads_per_poll: usize,
    /// Default batch for [`process_inbound_queue`](crate::PacketEngine::process_inbound_queue)
    /// callers that have no better number. Default: 10.
    pub dispatch_batch_size: usize,
    /// Sleep when a loop found nothing to do. Default: 1 ms.
    pub idle_sleep: Duration,
    /// Sleep while a loop is disabled or the transport is disconnected. Default: 50 ms.
    pub paused_sleep: Duration,
    /// Terminate a loop on its first per-packet error instead of reporting and
    /// continuing. Useful while developing packet types.
    pub strict: bool,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Events buffered per [`subscribe`](crate::PacketEngine::subscribe)
    /// receiver before further events are dropped for it. Default: 1024.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_batch_size: 3,
            max_reads_per_poll: 10,
            dispatch_batch_size: 10,
            idle_sleep: Duration::from_millis(1),
            paused_sleep: Duration::from_millis(50),
            strict: false,
            thread_name: "packetline".to_string(),
            event_capacity: 1024,
        }
    }
}
