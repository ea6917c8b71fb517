use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::Transport;

type Pipe = Arc<Mutex<BytesMut>>;

/// In-memory duplex transport.
///
/// [`LoopbackTransport::pair`] returns two connected ends: bytes written to one
/// end become available on the other. Each end tracks its own connection
/// state, so one side can be disconnected while the other keeps running.
#[derive(Debug)]
pub struct LoopbackTransport {
    inbound: Pipe,
    outbound: Pipe,
    connected: AtomicBool,
    disposed: AtomicBool,
}

impl LoopbackTransport {
    /// Create two connected ends of an in-memory channel.
    pub fn pair() -> (Self, Self) {
        let a_to_b: Pipe = Arc::new(Mutex::new(BytesMut::new()));
        let b_to_a: Pipe = Arc::new(Mutex::new(BytesMut::new()));

        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            connected: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            connected: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        };
        (a, b)
    }

    /// Append raw bytes to this end's inbound buffer, as if the peer had
    /// written them.
    pub fn feed_inbound(&self, data: &[u8]) {
        lock(&self.inbound).extend_from_slice(data);
    }

    /// Number of bytes written by this end that the peer has not read yet.
    pub fn pending_outbound(&self) -> usize {
        lock(&self.outbound).len()
    }

    /// Permanently close this end. Every later operation fails with `Disposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        debug!("loopback transport disposed");
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn bytes_available(&self) -> Result<usize> {
        self.ensure_usable()?;
        Ok(lock(&self.inbound).len())
    }

    fn read_exact(&self, n: usize) -> Result<Bytes> {
        self.ensure_usable()?;
        let mut inbound = lock(&self.inbound);
        if inbound.len() < n {
            return Err(TransportError::InsufficientData {
                requested: n,
                available: inbound.len(),
            });
        }
        Ok(inbound.split_to(n).freeze())
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        lock(&self.outbound).extend_from_slice(data);
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        debug!("loopback transport connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        debug!("loopback transport disconnected");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

fn lock(pipe: &Pipe) -> MutexGuard<'_, BytesMut> {
    pipe.lock().unwrap_or_else(PoisonError::into_inner)
}
