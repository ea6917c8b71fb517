use bytes::Bytes;

use crate::error::Result;

/// A duplex byte channel.
///
/// Methods take `&self` so one reader thread and one writer thread can share a
/// transport behind an `Arc`. Implementations keep their read side and write
/// side under separate locks; a read never waits for a write and vice versa.
///
/// `bytes_available` and `read_exact` must not block waiting for the peer:
/// `read_exact(n)` is only valid for `n <= bytes_available()`.
pub trait Transport: Send + Sync {
    /// Whether the channel is currently connected.
    fn is_connected(&self) -> bool;

    /// Number of bytes that can be read right now without blocking.
    fn bytes_available(&self) -> Result<usize>;

    /// Take exactly `n` already-available bytes.
    fn read_exact(&self, n: usize) -> Result<Bytes>;

    /// Write all of `data`. May block up to the transport's write timeout.
    fn write_bytes(&self, data: &[u8]) -> Result<()>;

    /// Open the channel. Fails with `AlreadyConnected` if it is open.
    fn connect(&self) -> Result<()>;

    /// Close the channel. Fails with `NotConnected` if it is closed.
    fn disconnect(&self) -> Result<()>;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str {
        "transport"
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn bytes_available(&self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn read_exact(&self, n: usize) -> Result<Bytes> {
        (**self).read_exact(n)
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        (**self).write_bytes(data)
    }

    fn connect(&self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&self) -> Result<()> {
        (**self).disconnect()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
