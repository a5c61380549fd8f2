//! Channel configuration.

use crate::DEFAULT_TIMEOUT_MS;

/// Settings applied when a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Timeout used by the `std::io` adapters, in milliseconds.
    pub default_timeout_ms: u32,

    /// Signal delivered to a thread blocked in a transfer when it is cancelled.
    #[cfg(unix)]
    pub interrupt_signal: i32,
}

impl ChannelConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            #[cfg(unix)]
            interrupt_signal: libc::SIGUSR2,
        }
    }

    /// Sets the timeout used by the `std::io` adapters.
    pub fn with_default_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Sets the signal used to interrupt blocked transfers.
    ///
    /// The signal's disposition is replaced by a no-op handler the first time
    /// a channel using it is opened.
    #[cfg(unix)]
    pub fn with_interrupt_signal(mut self, signal: i32) -> Self {
        self.interrupt_signal = signal;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}
