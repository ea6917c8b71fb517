use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use packetline_codec::Packet;
use tracing::{trace, warn};

use crate::error::DispatchError;

/// Error type returned by listeners and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Delivery tier. Every level is visited from `Highest` to `Lowest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Highest = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Lowest = 4,
}

impl Priority {
    /// All levels in delivery order.
    pub const ALL: [Priority; 5] = [
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Highest => "highest",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Lowest => "lowest",
        };
        f.write_str(name)
    }
}

/// Whether a consumer observes packets or may claim them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Listener,
    Handler,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener => f.write_str("listener"),
            Self::Handler => f.write_str("handler"),
        }
    }
}

/// Observes every delivered packet. Listeners cannot stop propagation.
pub trait Listener: Send + Sync {
    fn on_received(&self, packet: &dyn Packet) -> Result<(), BoxError>;
}

/// May claim a packet. Returning `Ok(true)` from `handle` ends the delivery.
pub trait Handler: Send + Sync {
    fn can_process(&self, _packet: &dyn Packet) -> bool {
        true
    }

    fn handle(&self, packet: &dyn Packet) -> Result<bool, BoxError>;
}

struct FnListener<F>(F);

impl<F> Listener for FnListener<F>
where
    F: Fn(&dyn Packet) -> Result<(), BoxError> + Send + Sync,
{
    fn on_received(&self, packet: &dyn Packet) -> Result<(), BoxError> {
        (self.0)(packet)
    }
}

struct FnHandler<P, H> {
    can_process: P,
    handle: H,
}

impl<P, H> Handler for FnHandler<P, H>
where
    P: Fn(&dyn Packet) -> bool + Send + Sync,
    H: Fn(&dyn Packet) -> Result<bool, BoxError> + Send + Sync,
{
    fn can_process(&self, packet: &dyn Packet) -> bool {
        (self.can_process)(packet)
    }

    fn handle(&self, packet: &dyn Packet) -> Result<bool, BoxError> {
        (self.handle)(packet)
    }
}

/// Token returned by every registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration {
    priority: Priority,
    stage: Stage,
    id: u64,
}

impl Registration {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

#[derive(Clone, Default)]
struct Level {
    listeners: Vec<(u64, Arc<dyn Listener>)>,
    handlers: Vec<(u64, Arc<dyn Handler>)>,
}

#[derive(Clone, Default)]
struct ListenerMap {
    levels: [Level; 5],
}

#[derive(Default)]
struct Inner {
    map: Mutex<Arc<ListenerMap>>,
    next_id: AtomicU64,
}

/// Delivers packets to listeners and handlers in priority order.
///
/// For each level from highest to lowest, every listener runs (in registration
/// order), then the level's handlers run until one claims the packet. A claim
/// ends the delivery immediately.
///
/// Each delivery iterates a snapshot of the registrations, so registering or
/// unregistering (from another thread, or from inside a callback) only affects
/// later deliveries. Cloning yields another handle to the same registrations.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener object.
    pub fn add_listener(&self, priority: Priority, listener: Arc<dyn Listener>) -> Registration {
        let id = self.next_id();
        self.update(|map| map.levels[priority.index()].listeners.push((id, listener)));
        Registration {
            priority,
            stage: Stage::Listener,
            id,
        }
    }

    /// Register a handler object.
    pub fn add_handler(&self, priority: Priority, handler: Arc<dyn Handler>) -> Registration {
        let id = self.next_id();
        self.update(|map| map.levels[priority.index()].handlers.push((id, handler)));
        Registration {
            priority,
            stage: Stage::Handler,
            id,
        }
    }

    /// Observe every packet.
    pub fn register_listener<F>(&self, priority: Priority, listener: F) -> Registration
    where
        F: Fn(&dyn Packet) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.add_listener(priority, Arc::new(FnListener(listener)))
    }

    /// Observe packets of type `T` only.
    pub fn register_listener_for<T, F>(&self, priority: Priority, listener: F) -> Registration
    where
        T: Packet,
        F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register_listener(priority, move |packet| match packet.downcast_ref::<T>() {
            Some(packet) => listener(packet),
            None => Ok(()),
        })
    }

    /// A handler offered every packet.
    pub fn register_handler<F>(&self, priority: Priority, handle: F) -> Registration
    where
        F: Fn(&dyn Packet) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.register_handler_with(priority, |_| true, handle)
    }

    /// A handler that is only offered packets accepted by `can_process`.
    pub fn register_handler_with<P, F>(
        &self,
        priority: Priority,
        can_process: P,
        handle: F,
    ) -> Registration
    where
        P: Fn(&dyn Packet) -> bool + Send + Sync + 'static,
        F: Fn(&dyn Packet) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.add_handler(priority, Arc::new(FnHandler { can_process, handle }))
    }

    /// A handler for packets of type `T` only.
    pub fn register_handler_for<T, F>(&self, priority: Priority, handle: F) -> Registration
    where
        T: Packet,
        F: Fn(&T) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.register_handler_with(
            priority,
            |packet| packet.is::<T>(),
            move |packet| match packet.downcast_ref::<T>() {
                Some(packet) => handle(packet),
                None => Ok(false),
            },
        )
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unregister(&self, registration: &Registration) -> bool {
        let mut removed = false;
        self.update(|map| {
            let level = &mut map.levels[registration.priority.index()];
            removed = match registration.stage {
                Stage::Listener => remove_by_id(&mut level.listeners, registration.id),
                Stage::Handler => remove_by_id(&mut level.handlers, registration.id),
            };
        });
        removed
    }

    /// Remove every listener and handler.
    pub fn clear(&self) {
        *self.lock() = Arc::new(ListenerMap::default());
    }

    pub fn listener_count(&self) -> usize {
        let map = self.snapshot();
        map.levels.iter().map(|level| level.listeners.len()).sum()
    }

    pub fn handler_count(&self) -> usize {
        let map = self.snapshot();
        map.levels.iter().map(|level| level.handlers.len()).sum()
    }

    /// Deliver one packet. Returns whether a handler claimed it.
    ///
    /// A listener error does not stop the remaining listeners at its level; the
    /// first one is returned once they have all run, and lower levels are not
    /// visited. A handler error is returned immediately.
    pub fn deliver(&self, packet: &dyn Packet) -> Result<bool, DispatchError> {
        let map = self.snapshot();

        for priority in Priority::ALL {
            let level = &map.levels[priority.index()];

            let mut failure: Option<BoxError> = None;
            let mut suppressed = 0;
            for (_, listener) in &level.listeners {
                if let Err(err) = listener.on_received(packet) {
                    warn!(%priority, error = %err, "listener failed");
                    if failure.is_none() {
                        failure = Some(err);
                    } else {
                        suppressed += 1;
                    }
                }
            }
            if let Some(source) = failure {
                return Err(DispatchError {
                    priority,
                    stage: Stage::Listener,
                    packet: format!("{packet:?}"),
                    source,
                    suppressed,
                });
            }

            for (_, handler) in &level.handlers {
                if !handler.can_process(packet) {
                    continue;
                }
                match handler.handle(packet) {
                    Ok(true) => {
                        trace!(%priority, packet = packet.type_name(), "packet handled");
                        return Ok(true);
                    }
                    Ok(false) => {}
                    Err(source) => {
                        return Err(DispatchError {
                            priority,
                            stage: Stage::Handler,
                            packet: format!("{packet:?}"),
                            source,
                            suppressed: 0,
                        });
                    }
                }
            }
        }

        trace!(packet = packet.type_name(), "packet not handled");
        Ok(false)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self) -> Arc<ListenerMap> {
        Arc::clone(&self.lock())
    }

    fn update(&self, f: impl FnOnce(&mut ListenerMap)) {
        let mut map = self.lock();
        f(Arc::make_mut(&mut map));
    }

    fn lock(&self) -> MutexGuard<'_, Arc<ListenerMap>> {
        self.inner.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_by_id<T: ?Sized>(entries: &mut Vec<(u64, Arc<T>)>, id: u64) -> bool {
    let before = entries.len();
    entries.retain(|(entry_id, _)| *entry_id != id);
    entries.len() != before
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
