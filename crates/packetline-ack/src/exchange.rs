use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use packetline_codec::{AckPacket, CorrelationKey, Direction, Packet};
use packetline_engine::{BoxError, Dispatcher, Handler, OutboundQueue, PacketEngine, Registration};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::handle::ResponseHandle;
use crate::pending::PendingTable;
use crate::watchdog::WatchdogGuard;

type Processor<T> = dyn Fn(&T, &Responder<T>) -> bool + Send + Sync;
type ResendStrategy<T> = dyn Fn(&T, &OutboundQueue) + Send + Sync;

/// Counts from one timeout scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    /// Requests re-sent because their timeout elapsed.
    pub resent: usize,
    /// Requests failed after exhausting their retries.
    pub expired: usize,
    /// Requests dropped because nobody holds their handle anymore.
    pub abandoned: usize,
}

impl TimeoutReport {
    pub fn is_empty(&self) -> bool {
        self.resent == 0 && self.expired == 0 && self.abandoned == 0
    }
}

/// Answers one received request.
///
/// The response is stamped with the request's key and routed back to the
/// client through the engine's outbound queue.
pub struct Responder<T> {
    key: CorrelationKey,
    outbound: OutboundQueue,
    _packet: PhantomData<fn(T)>,
}

impl<T: AckPacket> Responder<T> {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn respond(&self, mut response: T) {
        response.set_key(self.key);
        response.set_destination(Direction::ToClient);
        trace!(key = self.key, packet = response.type_name(), "responding");
        self.outbound.send(response);
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("key", &self.key).finish()
    }
}

struct Inner<T> {
    outbound: OutboundQueue,
    pending: Mutex<PendingTable<T>>,
    config: ExchangeConfig,
    processor: Option<Box<Processor<T>>>,
    resend: Box<ResendStrategy<T>>,
}

impl<T: AckPacket + Clone> Inner<T> {
    fn pending(&self) -> MutexGuard<'_, PendingTable<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_timeouts_at(&self, now: Instant) -> TimeoutReport {
        let expiry = self
            .pending()
            .expire(now, self.config.timeout, self.config.max_retries);

        // Resend outside the lock so a strategy may call back into the exchange.
        for (key, request) in &expiry.resend {
            debug!(key, packet = request.type_name(), "re-transmitting request");
            (self.resend)(request, &self.outbound);
        }
        if expiry.expired > 0 {
            warn!(
                expired = expiry.expired,
                max_retries = self.config.max_retries,
                "requests timed out"
            );
        }

        TimeoutReport {
            resent: expiry.resend.len(),
            expired: expiry.expired,
            abandoned: expiry.abandoned,
        }
    }

    fn on_request(&self, request: &T) -> bool {
        let Some(processor) = &self.processor else {
            trace!(key = request.key(), "no processor; request left to other handlers");
            return false;
        };
        let responder = Responder {
            key: request.key(),
            outbound: self.outbound.clone(),
            _packet: PhantomData,
        };
        processor(request, &responder)
    }

    fn on_response(&self, response: &T) {
        let key = response.key();
        if self.pending().complete(key, response.clone()) {
            trace!(key, "request completed");
        } else {
            debug!(key, packet = response.type_name(), "dropping response with no pending request");
        }
    }
}

/// Dispatcher handler routing one ack type into its exchange.
struct ExchangeHandler<T> {
    inner: Weak<Inner<T>>,
}

impl<T: AckPacket + Clone> Handler for ExchangeHandler<T> {
    fn can_process(&self, packet: &dyn Packet) -> bool {
        packet.is::<T>()
    }

    fn handle(&self, packet: &dyn Packet) -> std::result::Result<bool, BoxError> {
        let (Some(inner), Some(ack)) = (self.inner.upgrade(), packet.downcast_ref::<T>()) else {
            return Ok(false);
        };
        match ack.destination() {
            Direction::ToServer => Ok(inner.on_request(ack)),
            Direction::ToClient => {
                inner.on_response(ack);
                Ok(true)
            }
        }
    }
}

/// Configures a [`ReliableExchange`] before it is attached to an engine.
pub struct ReliableExchangeBuilder<T> {
    config: ExchangeConfig,
    processor: Option<Box<Processor<T>>>,
    resend: Option<Box<ResendStrategy<T>>>,
}

impl<T: AckPacket + Clone> ReliableExchangeBuilder<T> {
    /// Server side: answer requests of this type.
    ///
    /// Returning `false` leaves the request to lower handlers.
    pub fn processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(&T, &Responder<T>) -> bool + Send + Sync + 'static,
    {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Replace the default re-send, which enqueues a copy of the request.
    pub fn resend_with<F>(mut self, resend: F) -> Self
    where
        F: Fn(&T, &OutboundQueue) + Send + Sync + 'static,
    {
        self.resend = Some(Box::new(resend));
        self
    }

    /// Attach to an engine's dispatcher and outbound queue.
    pub fn attach(self, engine: &PacketEngine) -> ReliableExchange<T> {
        self.attach_to(engine.dispatcher(), engine.outbound())
    }

    /// Attach to an explicit dispatcher and outbound queue.
    pub fn attach_to(self, dispatcher: &Dispatcher, outbound: OutboundQueue) -> ReliableExchange<T> {
        let resend = self.resend.unwrap_or_else(|| {
            Box::new(|request: &T, outbound: &OutboundQueue| outbound.send(request.clone()))
        });
        let priority = self.config.priority;
        let inner = Arc::new(Inner {
            outbound,
            pending: Mutex::new(PendingTable::new()),
            config: self.config,
            processor: self.processor,
            resend,
        });
        let handler = ExchangeHandler {
            inner: Arc::downgrade(&inner),
        };
        let registration = dispatcher.add_handler(priority, Arc::new(handler));
        debug!(
            packet = std::any::type_name::<T>(),
            %priority,
            "exchange attached"
        );

        ReliableExchange {
            inner,
            dispatcher: dispatcher.clone(),
            registration,
        }
    }
}

/// Request/response correlation for one ack packet type.
///
/// Dropping the exchange unregisters its handler and resolves every pending
/// request as abandoned.
pub struct ReliableExchange<T: AckPacket + Clone> {
    inner: Arc<Inner<T>>,
    dispatcher: Dispatcher,
    registration: Registration,
}

impl<T: AckPacket + Clone> ReliableExchange<T> {
    pub fn builder(config: ExchangeConfig) -> ReliableExchangeBuilder<T> {
        ReliableExchangeBuilder {
            config,
            processor: None,
            resend: None,
        }
    }

    /// Client-side exchange with default settings.
    pub fn attach(engine: &PacketEngine) -> Self {
        Self::builder(ExchangeConfig::default()).attach(engine)
    }

    /// Issue `request` under a fresh correlation key.
    pub fn request(&self, mut request: T) -> ResponseHandle<T> {
        let (tx, rx) = oneshot::channel();
        let key = {
            let mut pending = self.inner.pending();
            let key = pending.allocate_key();
            request.set_key(key);
            request.set_destination(Direction::ToServer);
            // Key was just allocated, so the insert cannot collide.
            let _ = pending.insert(key, request.clone(), tx, Instant::now());
            key
        };
        self.enqueue(key, request);
        ResponseHandle::new(key, rx)
    }

    /// Issue `request` under a caller-chosen key.
    pub fn request_with_key(&self, mut request: T, key: CorrelationKey) -> Result<ResponseHandle<T>> {
        let (tx, rx) = oneshot::channel();
        request.set_key(key);
        request.set_destination(Direction::ToServer);
        self.inner
            .pending()
            .insert(key, request.clone(), tx, Instant::now())?;
        self.enqueue(key, request);
        Ok(ResponseHandle::new(key, rx))
    }

    fn enqueue(&self, key: CorrelationKey, request: T) {
        trace!(key, packet = request.type_name(), "request issued");
        self.inner.outbound.send(request);
    }

    /// Resolve `key` as cancelled. Returns `false` if it was not pending.
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        self.inner.pending().cancel(key)
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.pending().cancel_all()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Re-sends performed so far for a pending request.
    pub fn retry_count(&self, key: CorrelationKey) -> Option<u32> {
        self.inner.pending().retries(key)
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    /// Re-send or fail requests whose timeout has elapsed.
    pub fn check_timeouts(&self) -> TimeoutReport {
        self.inner.check_timeouts_at(Instant::now())
    }

    /// [`check_timeouts`](Self::check_timeouts) against an explicit clock.
    pub fn check_timeouts_at(&self, now: Instant) -> TimeoutReport {
        self.inner.check_timeouts_at(now)
    }

    /// Run [`check_timeouts`](Self::check_timeouts) on a background thread
    /// every `interval`. The thread ends when the guard or the exchange is dropped.
    pub fn spawn_watchdog(&self, interval: Duration) -> Result<WatchdogGuard> {
        let inner = Arc::downgrade(&self.inner);
        WatchdogGuard::spawn("packetline-ack-watchdog".into(), interval, move || {
            match inner.upgrade() {
                Some(inner) => {
                    inner.check_timeouts_at(Instant::now());
                    true
                }
                None => false,
            }
        })
        .map_err(|e| ExchangeError::Spawn(e.to_string()))
    }
}

impl<T: AckPacket + Clone> Drop for ReliableExchange<T> {
    fn drop(&mut self) {
        self.dispatcher.unregister(&self.registration);
    }
}

impl<T: AckPacket + Clone> fmt::Debug for ReliableExchange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableExchange")
            .field("packet", &std::any::type_name::<T>())
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}
