use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use packetline_codec::Packet;

/// FIFO of packets guarded by a single mutex.
///
/// The lock is held only for the length of one push or pop batch, never across
/// encoding, decoding or delivery.
#[derive(Default)]
pub struct PacketQueue {
    items: Mutex<VecDeque<Box<dyn Packet>>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: Box<dyn Packet>) {
        self.lock().push_back(packet);
    }

    /// Append several packets in order under one lock acquisition.
    pub fn extend(&self, packets: impl IntoIterator<Item = Box<dyn Packet>>) {
        self.lock().extend(packets);
    }

    /// Remove up to `max` packets from the front.
    pub fn pop_batch(&self, max: usize) -> Vec<Box<dyn Packet>> {
        let mut items = self.lock();
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    /// Put packets back at the front, keeping their relative order.
    pub fn push_front_batch(&self, packets: Vec<Box<dyn Packet>>) {
        if packets.is_empty() {
            return;
        }
        let mut items = self.lock();
        for packet in packets.into_iter().rev() {
            items.push_front(packet);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued packet and return how many there were.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Box<dyn Packet>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Cloneable handle for enqueueing outbound packets from any thread.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    queue: Arc<PacketQueue>,
}

impl OutboundQueue {
    pub(crate) fn new(queue: Arc<PacketQueue>) -> Self {
        Self { queue }
    }

    /// Queue a packet for the write loop.
    pub fn send<P: Packet>(&self, packet: P) {
        self.queue.push(Box::new(packet));
    }

    pub fn send_boxed(&self, packet: Box<dyn Packet>) {
        self.queue.push(packet);
    }

    /// Packets waiting to be written.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
