use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use packetline_codec::CorrelationKey;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{ExchangeError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Completion handle of one request.
///
/// Resolves exactly once: with the response, or with a timeout, cancellation or
/// abandonment error. The handle can be blocked on from a plain thread, polled,
/// or awaited from async code.
pub struct ResponseHandle<T> {
    key: CorrelationKey,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> ResponseHandle<T> {
    pub(crate) fn new(key: CorrelationKey, receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { key, receiver }
    }

    /// Correlation key stamped on the request.
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Block the current thread until the request resolves.
    ///
    /// Must not be called from within an async runtime; await the handle there.
    pub fn wait(self) -> Result<T> {
        let key = self.key;
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(ExchangeError::Abandoned { key }))
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.try_result() {
                return Some(result);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Take the result if the request has resolved.
    ///
    /// The result is handed out once; later calls report the request as abandoned.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ExchangeError::Abandoned { key: self.key })),
        }
    }
}

impl<T> Future for ResponseHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let key = this.key;
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ExchangeError::Abandoned { key })))
    }
}

impl<T> fmt::Debug for ResponseHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::task::Waker;

    use super::*;

    #[test]
    fn try_result_pending_then_ready() {
        let (tx, rx) = oneshot::channel();
        let mut handle = ResponseHandle::new(7, rx);
        assert_eq!(handle.key(), 7);
        assert!(handle.try_result().is_none());

        tx.send(Ok("done")).unwrap();
        assert_eq!(handle.try_result(), Some(Ok("done")));
    }

    #[test]
    fn dropped_sender_is_abandoned() {
        let (tx, rx) = oneshot::channel::<Result<u8>>();
        drop(tx);
        let handle = ResponseHandle::new(3, rx);
        assert_eq!(handle.wait(), Err(ExchangeError::Abandoned { key: 3 }));
    }

    #[test]
    fn wait_timeout_gives_up() {
        let (_tx, rx) = oneshot::channel::<Result<u8>>();
        let mut handle = ResponseHandle::new(1, rx);
        let start = Instant::now();
        assert!(handle.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_blocks_until_sent() {
        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle::new(1, rx);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send(Ok(42u32)).unwrap();
        });
        assert_eq!(handle.wait(), Ok(42));
        sender.join().unwrap();
    }

    #[test]
    fn polls_as_future() {
        let (tx, rx) = oneshot::channel::<Result<u8>>();
        let mut handle = ResponseHandle::new(1, rx);
        let mut cx = Context::from_waker(Waker::noop());

        assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
        tx.send(Err(ExchangeError::Cancelled { key: 1 })).unwrap();
        assert_eq!(
            Pin::new(&mut handle).poll(&mut cx),
            Poll::Ready(Err(ExchangeError::Cancelled { key: 1 }))
        );
    }
}
