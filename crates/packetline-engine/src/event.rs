use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::trace;

use crate::error::EngineError;

/// Which worker loop an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Read,
    Write,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Notifications emitted by the engine's worker loops.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Packets were decoded into the inbound queue; time to dispatch.
    DataAvailable { count: usize },
    /// A single inbound frame could not be decoded; the loop continues.
    ReadFailed { error: Arc<EngineError> },
    /// An outbound batch failed part-way; the loop continues.
    WriteFailed { error: Arc<EngineError> },
    /// The byte stream can no longer be trusted. Buffered bytes were dropped
    /// and the transport disconnected; reconnecting is up to the owner.
    ConnectionFault { error: Arc<EngineError> },
    /// A worker loop returned.
    LoopExited { kind: LoopKind, failed: bool },
}

type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Fan-out of engine events to channel subscribers and callbacks.
///
/// Each subscriber gets a bounded channel. Events for a subscriber whose
/// channel is full are dropped, so a receiver that is never drained costs at
/// most `capacity` events.
pub(crate) struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
    callbacks: Mutex<Vec<Callback>>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        lock(&self.subscribers).push(tx);
        rx
    }

    pub(crate) fn on_event(&self, callback: Callback) {
        lock(&self.callbacks).push(callback);
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(&event);
        }
        // Dropped receivers unsubscribe themselves.
        lock(&self.subscribers).retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                trace!(event = ?dropped, "subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
