use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};

use crate::closing;
use crate::error::Result;

/// Close and lazy-close bookkeeping for one channel.
///
/// Backends read it to pick timeouts and to notice a close, and call
/// [`Lifecycle::close`] when an idle timeout expires.
#[derive(Debug)]
pub struct Lifecycle {
    closed: AtomicBool,
    /// 0 means lazy close is disarmed.
    lazy_timeout_ms: AtomicU32,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            lazy_timeout_ms: AtomicU32::new(0),
        }
    }

    /// Returns true once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the armed idle timeout, or `None` when lazy close is disarmed.
    pub fn idle_timeout_ms(&self) -> Option<u32> {
        match self.lazy_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            timeout => Some(timeout),
        }
    }

    /// Marks the channel closed and publishes it with `cancel_io`.
    ///
    /// Runs under the closing lock. If `cancel_io` fails the channel is
    /// reopened and the error returned.
    pub fn close(&self, cancel_io: impl FnOnce() -> Result<()>) -> Result<()> {
        if self.is_closed() {
            warn!("Already closed");
            return Ok(());
        }
        debug!("Closing channel");
        let _guard = closing::lock();
        self.closed.store(true, Ordering::SeqCst);
        if let Err(err) = cancel_io() {
            self.closed.store(false, Ordering::SeqCst);
            warn!("Couldn't cancel I/O for close notification, error {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Arms lazy close with `timeout_ms`, or closes outright when it is 0.
    pub fn lazy_close(
        &self,
        timeout_ms: u32,
        cancel_io: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        if timeout_ms == 0 {
            return self.close(cancel_io);
        }
        debug!("Lazy closing after {}ms", timeout_ms);
        let _guard = closing::lock();
        self.lazy_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        if let Err(err) = cancel_io() {
            self.lazy_timeout_ms.store(0, Ordering::SeqCst);
            warn!(
                "Couldn't cancel I/O for lazy close notification, error {}",
                err
            );
            return Err(err);
        }
        Ok(())
    }

    /// Disarms lazy close. Does not touch the closed flag.
    pub fn cancel_lazy_close(&self) {
        let previous = self.lazy_timeout_ms.swap(0, Ordering::SeqCst);
        debug!("Cancelling lazy close (was {}ms)", previous);
    }
}
