//! `std::io` adapters.
//!
//! `&Channel` implements [`std::io::Read`] and [`std::io::Write`] using the
//! channel's configured default timeout, so callers that need full delivery
//! can use `read_exact`/`write_all`. The channel itself never loops.

use crate::backend::Backend;
use crate::channel::Channel;

impl<B: Backend> std::io::Read for &Channel<B> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(Channel::<B>::read(self, buf, self.config().default_timeout_ms)?)
    }
}

impl<B: Backend> std::io::Write for &Channel<B> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(Channel::<B>::write(self, buf, self.config().default_timeout_ms)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(Channel::<B>::flush(self)?)
    }
}
