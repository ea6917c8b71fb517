use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

/// Keeps a watchdog thread alive. Dropping the guard stops and joins it.
#[derive(Debug)]
pub struct WatchdogGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogGuard {
    /// Run `tick` every `interval` until the guard is dropped or `tick`
    /// returns `false`.
    pub(crate) fn spawn<F>(name: String, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new().name(name).spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "watchdog started");
            while !flag.load(Ordering::SeqCst) {
                thread::park_timeout(interval);
                if flag.load(Ordering::SeqCst) || !tick() {
                    break;
                }
            }
            debug!("watchdog exited");
        })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the watchdog and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
