use std::collections::HashMap;
use std::time::{Duration, Instant};

use packetline_codec::CorrelationKey;
use tokio::sync::oneshot;

use crate::error::ExchangeError;

pub(crate) type Completion<T> = oneshot::Sender<Result<T, ExchangeError>>;

struct PendingRequest<T> {
    request: T,
    completion: Completion<T>,
    retries: u32,
    issued_at: Instant,
}

/// Outcome of one timeout scan.
pub(crate) struct Expiry<T> {
    pub(crate) resend: Vec<(CorrelationKey, T)>,
    pub(crate) expired: usize,
    pub(crate) abandoned: usize,
}

/// Outstanding requests keyed by correlation key.
pub(crate) struct PendingTable<T> {
    entries: HashMap<CorrelationKey, PendingRequest<T>>,
    next_key: CorrelationKey,
}

impl<T: Clone> PendingTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_key: 1,
        }
    }

    /// Next key not currently pending. Keys wrap around.
    pub(crate) fn allocate_key(&mut self) -> CorrelationKey {
        loop {
            let key = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if !self.entries.contains_key(&key) {
                return key;
            }
        }
    }

    pub(crate) fn insert(
        &mut self,
        key: CorrelationKey,
        request: T,
        completion: Completion<T>,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        if self.entries.contains_key(&key) {
            return Err(ExchangeError::DuplicateKey(key));
        }
        self.entries.insert(
            key,
            PendingRequest {
                request,
                completion,
                retries: 0,
                issued_at: now,
            },
        );
        Ok(())
    }

    /// Resolve `key` with `response`. Returns `false` if nothing was pending.
    pub(crate) fn complete(&mut self, key: CorrelationKey, response: T) -> bool {
        match self.entries.remove(&key) {
            Some(pending) => {
                // The caller may have dropped its handle; that is not an error.
                let _ = pending.completion.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self, key: CorrelationKey) -> bool {
        match self.entries.remove(&key) {
            Some(pending) => {
                let _ = pending.completion.send(Err(ExchangeError::Cancelled { key }));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) -> usize {
        let cancelled = self.entries.len();
        for (key, pending) in self.entries.drain() {
            let _ = pending.completion.send(Err(ExchangeError::Cancelled { key }));
        }
        cancelled
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn retries(&self, key: CorrelationKey) -> Option<u32> {
        self.entries.get(&key).map(|pending| pending.retries)
    }

    /// Scan for requests unanswered for at least `timeout` as of `now`.
    ///
    /// Requests with retry budget left are counted and returned for re-sending
    /// with their timestamp reset; the rest fail with a timeout. Requests whose
    /// handle was dropped are discarded.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> Expiry<T> {
        let mut expiry = Expiry {
            resend: Vec::new(),
            expired: 0,
            abandoned: 0,
        };

        let mut failed = Vec::new();
        let mut dropped = Vec::new();
        for (key, pending) in self.entries.iter_mut() {
            if pending.completion.is_closed() {
                dropped.push(*key);
                continue;
            }
            if now.saturating_duration_since(pending.issued_at) < timeout {
                continue;
            }
            if pending.retries >= max_retries {
                failed.push(*key);
                continue;
            }
            pending.retries += 1;
            pending.issued_at = now;
            expiry.resend.push((*key, pending.request.clone()));
        }

        for key in dropped {
            self.entries.remove(&key);
            expiry.abandoned += 1;
        }
        for key in failed {
            if let Some(pending) = self.entries.remove(&key) {
                let _ = pending.completion.send(Err(ExchangeError::Timeout {
                    key,
                    retries: pending.retries,
                }));
                expiry.expired += 1;
            }
        }

        expiry.resend.sort_by_key(|(key, _)| *key);
        expiry
    }
}
