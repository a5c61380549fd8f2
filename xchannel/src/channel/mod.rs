//! The channel: one owned OS handle with timeout, cancel and lazy-close
//! behavior.
//!
//! The public contract lives here; the platform backend only performs the
//! transfers and the cancellation request.

mod lifecycle;

pub use lifecycle::Lifecycle;

use log::{info, warn};

use crate::backend::{Backend, NativeBackend, OsHandle};
use crate::config::ChannelConfig;
use crate::error::{self, Error, ErrorKind, Result};

/// Observable channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is open and transfers use the caller's timeout.
    Open,

    /// Lazy close is armed: transfers are capped at the idle timeout and the
    /// channel closes itself when one elapses.
    LazyClosing {
        /// The armed idle timeout in milliseconds.
        idle_timeout_ms: u32,
    },

    /// Channel is closed.
    Closed,
}

/// A timeout-capable, cancellable I/O channel.
///
/// All operations take `&self`: one thread may transfer while another cancels
/// or closes. Callers must not issue two reads (or two writes) concurrently on
/// the same channel; one read and one write may be in flight together.
#[derive(Debug)]
pub struct Channel<B: Backend = NativeBackend> {
    backend: B,
    lifecycle: Lifecycle,
    config: ChannelConfig,
}

impl Channel<NativeBackend> {
    /// Takes ownership of an open handle with the default configuration.
    pub fn open(handle: OsHandle) -> Result<Self> {
        Self::with_config(handle, ChannelConfig::default())
    }

    /// Takes ownership of an open handle.
    pub fn with_config(handle: OsHandle, config: ChannelConfig) -> Result<Self> {
        let backend = error::record(NativeBackend::open(handle, &config))?;
        info!("Channel opened");
        Ok(Self::with_backend(backend, config))
    }
}

impl<B: Backend> Channel<B> {
    /// Builds a channel around an already constructed backend.
    pub fn with_backend(backend: B, config: ChannelConfig) -> Self {
        Self {
            backend,
            lifecycle: Lifecycle::new(),
            config,
        }
    }

    /// Returns the configuration the channel was opened with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns true once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Returns the armed idle timeout, if lazy close is armed.
    pub fn idle_timeout_ms(&self) -> Option<u32> {
        self.lifecycle.idle_timeout_ms()
    }

    /// Returns the current channel state.
    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            ChannelState::Closed
        } else if let Some(idle_timeout_ms) = self.idle_timeout_ms() {
            ChannelState::LazyClosing { idle_timeout_ms }
        } else {
            ChannelState::Open
        }
    }

    /// Reads up to `buf.len()` bytes, waiting at most `timeout_ms`.
    ///
    /// Returns the number of bytes read; 0 is a valid result (end of
    /// stream). If lazy close is armed, the wait is capped at the idle
    /// timeout and the channel may close itself as a side effect.
    pub fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        error::record(self.read_inner(buf, timeout_ms))
    }

    fn read_inner(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        if self.is_closed() {
            warn!("Channel already closed");
            return Err(Error::new(ErrorKind::AlreadyClosed));
        }
        self.backend.read(&self.lifecycle, buf, timeout_ms)
    }

    /// Writes up to `buf.len()` bytes, waiting at most `timeout_ms`.
    ///
    /// A partial write is a success; callers that need full delivery loop.
    pub fn write(&self, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        error::record(self.write_inner(buf, timeout_ms))
    }

    fn write_inner(&self, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        if self.is_closed() {
            warn!("Channel already closed");
            return Err(Error::new(ErrorKind::AlreadyClosed));
        }
        self.backend.write(&self.lifecycle, buf, timeout_ms)
    }

    /// Forces buffered data to the underlying medium.
    pub fn flush(&self) -> Result<()> {
        error::record(self.backend.flush())
    }

    /// Asks any in-flight read or write to abort as soon as possible.
    ///
    /// Succeeds without effect when nothing is in flight. Does not close the
    /// channel.
    pub fn cancel_io(&self) -> Result<()> {
        error::record(self.backend.cancel_io())
    }

    /// Closes the channel, cancelling in-flight I/O.
    ///
    /// Idempotent. If the cancellation cannot be delivered the channel stays
    /// open and the error is returned. The handle itself is released when
    /// the channel is dropped.
    pub fn close(&self) -> Result<()> {
        error::record(self.lifecycle.close(|| self.backend.cancel_io()))
    }

    /// Arms lazy close: the current or next transfer is capped at
    /// `timeout_ms`, and the channel closes if it stays idle that long.
    ///
    /// `lazy_close(0)` is exactly [`Channel::close`].
    pub fn lazy_close(&self, timeout_ms: u32) -> Result<()> {
        error::record(
            self.lifecycle
                .lazy_close(timeout_ms, || self.backend.cancel_io()),
        )
    }

    /// Disarms lazy close; later transfers get their full timeout again.
    pub fn cancel_lazy_close(&self) -> Result<()> {
        self.lifecycle.cancel_lazy_close();
        Ok(())
    }
}

impl<B: Backend> Drop for Channel<B> {
    fn drop(&mut self) {
        info!("Channel released");
    }
}
