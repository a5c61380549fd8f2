//! Interrupt-backed backend for platforms with only blocking calls.
//!
//! Each transfer records which thread is blocked on the channel, waits for
//! readiness under the armed timeout, then performs a non-blocking transfer.
//! [`Backend::cancel_io`] takes the record and signals that thread; an
//! interrupted transfer that was not yet a lazy attempt gets one more attempt
//! under the idle timeout before it reports `Cancelled`.

use core::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use libc::c_int;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::signal::{self, Masked, ThreadRef};
use super::{Backend, OpState};
use crate::TIMEOUT_INFINITE;
use crate::channel::Lifecycle;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    fn slot(self) -> usize {
        self as usize
    }

    fn events(self) -> libc::c_short {
        match self {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("Read"),
            Direction::Write => f.write_str("Write"),
        }
    }
}

/// A thread blocked in a transfer, and the timeout it armed.
#[derive(Debug, Clone, Copy)]
struct Blocked {
    thread: ThreadRef,
    timeout_ms: u32,
}

/// How one blocking call ended.
#[derive(Debug)]
enum Outcome {
    Transferred(usize),
    Interrupted,
    Expired,
    Failed(Error),
}

/// Backend for Unix file descriptors.
#[derive(Debug)]
pub struct InterruptBackend {
    fd: OwnedFd,
    signal: c_int,
    /// One record per direction: a read and a write may block together.
    blocked: Mutex<[Option<Blocked>; 2]>,
}

impl InterruptBackend {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub fn open(fd: OwnedFd, config: &ChannelConfig) -> Result<Self> {
        signal::install(config.interrupt_signal)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            signal: config.interrupt_signal,
            blocked: Mutex::new([None; 2]),
        })
    }

    /// Returns the number of threads currently blocked on this channel.
    pub fn blocked_threads(&self) -> usize {
        self.blocked.lock().iter().flatten().count()
    }

    fn set_blocked(&self, direction: Direction, blocked: Option<Blocked>) {
        self.blocked.lock()[direction.slot()] = blocked;
    }

    fn transfer(
        &self,
        lifecycle: &Lifecycle,
        direction: Direction,
        timeout_ms: u32,
        mut op: impl FnMut() -> isize,
    ) -> Result<usize> {
        let mut state = OpState::start(lifecycle, timeout_ms);
        while let Some((timeout_ms, lazy)) = state.wait() {
            state = self.attempt(lifecycle, direction, timeout_ms, lazy, &mut op);
        }
        state.into_result()
    }

    fn attempt(
        &self,
        lifecycle: &Lifecycle,
        direction: Direction,
        timeout_ms: u32,
        lazy: bool,
        op: &mut impl FnMut() -> isize,
    ) -> OpState {
        match self.blocking_call(lifecycle, direction, timeout_ms, lazy, op) {
            Outcome::Transferred(n) => OpState::Done(n),
            Outcome::Failed(err) => {
                warn!("Couldn't {} file, error {}", direction, err);
                OpState::Failed(err)
            }
            Outcome::Interrupted => {
                debug!("{} interrupted", direction);
                if lazy && lifecycle.idle_timeout_ms().is_some() {
                    self.close_on_idle(lifecycle);
                }
                if !lifecycle.is_closed() && !lazy {
                    let next = OpState::idle(lifecycle);
                    debug!("Resuming operation with idle timeout of {:?}", next);
                    next
                } else {
                    OpState::Cancelled
                }
            }
            Outcome::Expired => {
                debug!("Timeout elapsed");
                if OpState::closes_on_expiry(lifecycle, lazy) {
                    self.close_on_idle(lifecycle);
                }
                OpState::expired(lifecycle, timeout_ms, lazy)
            }
        }
    }

    fn close_on_idle(&self, lifecycle: &Lifecycle) {
        info!("Closing channel on idle timeout");
        if let Err(err) = lifecycle.close(|| self.cancel_io()) {
            warn!("Couldn't close channel on idle timeout, error {}", err);
        }
    }

    fn blocking_call(
        &self,
        lifecycle: &Lifecycle,
        direction: Direction,
        timeout_ms: u32,
        lazy: bool,
        op: &mut impl FnMut() -> isize,
    ) -> Outcome {
        let masked = match Masked::block(self.signal) {
            Ok(masked) => masked,
            Err(err) => return Outcome::Failed(err),
        };
        self.set_blocked(
            direction,
            Some(Blocked {
                thread: ThreadRef::current(),
                timeout_ms,
            }),
        );
        // A close, or a lazy close tighter than this attempt, published before
        // the record was set sent its interrupt to nobody; pick it up here.
        let missed_cancel = lifecycle.is_closed()
            || (!lazy && lifecycle.idle_timeout_ms().is_some_and(|idle| idle < timeout_ms));
        let outcome = if missed_cancel {
            Outcome::Interrupted
        } else {
            self.wait_and_transfer(direction, timeout_ms, &masked, op)
        };
        self.set_blocked(direction, None);
        drop(masked);
        outcome
    }

    fn wait_and_transfer(
        &self,
        direction: Direction,
        timeout_ms: u32,
        masked: &Masked,
        op: &mut impl FnMut() -> isize,
    ) -> Outcome {
        let fd = self.fd.as_raw_fd();
        let deadline = (timeout_ms != TIMEOUT_INFINITE)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms.into()));
        loop {
            let remaining = match deadline {
                None => TIMEOUT_INFINITE,
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(TIMEOUT_INFINITE - 1)) as u32,
            };
            debug!("Waiting for I/O for {}ms", remaining);
            if let Some(outcome) = wait_ready(fd, direction.events(), remaining, masked) {
                return outcome;
            }
            let n = op();
            if n >= 0 {
                return Outcome::Transferred(n as usize);
            }
            let err = Error::last_os_error();
            match err.code() {
                libc::EINTR => return Outcome::Interrupted,
                code if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    if remaining == 0 {
                        return Outcome::Expired;
                    }
                }
                _ => return Outcome::Failed(err),
            }
        }
    }
}

impl Backend for InterruptBackend {
    fn read(&self, lifecycle: &Lifecycle, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let fd = self.fd.as_raw_fd();
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        self.transfer(lifecycle, Direction::Read, timeout_ms, || {
            // SAFETY: `ptr`/`len` describe `buf`, which outlives the transfer.
            unsafe { libc::read(fd, ptr.cast(), len) }
        })
    }

    fn write(&self, lifecycle: &Lifecycle, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        let fd = self.fd.as_raw_fd();
        self.transfer(lifecycle, Direction::Write, timeout_ms, || {
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }
        })
    }

    fn flush(&self) -> Result<()> {
        // SAFETY: the descriptor is owned and open.
        if unsafe { libc::fsync(self.fd.as_raw_fd()) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn cancel_io(&self) -> Result<()> {
        // The lock is held while signalling: a blocked thread cannot clear its
        // record, and so cannot exit, until the interrupt has been sent.
        let mut blocked = self.blocked.lock();
        let mut pending = false;
        for direction in Direction::ALL {
            if let Some(record) = blocked[direction.slot()].take() {
                pending = true;
                debug!(
                    "Interrupting thread blocked on {} ({}ms)",
                    direction, record.timeout_ms
                );
                record.thread.interrupt(self.signal)?;
            }
        }
        if !pending {
            debug!("No pending I/O to cancel");
        }
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an owned, open descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0
            && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Waits until `fd` is ready for `events`; `None` once it is.
fn wait_ready(
    fd: RawFd,
    events: libc::c_short,
    timeout_ms: u32,
    masked: &Masked,
) -> Option<Outcome> {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = poll_masked(&mut pollfd, timeout_ms, masked);
    if rc > 0 {
        return None;
    }
    if rc == 0 {
        return Some(Outcome::Expired);
    }
    let err = Error::last_os_error();
    if err.code() == libc::EINTR {
        Some(Outcome::Interrupted)
    } else {
        Some(Outcome::Failed(err))
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn poll_masked(pollfd: &mut libc::pollfd, timeout_ms: u32, masked: &Masked) -> c_int {
    // SAFETY: a zeroed timespec is valid; the fields are set below.
    let mut timeout: libc::timespec = unsafe { std::mem::zeroed() };
    timeout.tv_sec = (timeout_ms / 1000) as libc::time_t;
    timeout.tv_nsec = ((timeout_ms % 1000) * 1_000_000) as libc::c_long;
    let timeout_ptr = if timeout_ms == TIMEOUT_INFINITE {
        std::ptr::null()
    } else {
        &timeout as *const libc::timespec
    };
    let mask = masked.wait_mask();
    // SAFETY: all pointers reference live locals; the mask opens the
    // interrupt signal only for the duration of the wait.
    unsafe { libc::ppoll(pollfd, 1, timeout_ptr, &mask) }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn poll_masked(pollfd: &mut libc::pollfd, timeout_ms: u32, masked: &Masked) -> c_int {
    let timeout = if timeout_ms == TIMEOUT_INFINITE {
        -1
    } else {
        timeout_ms.min(c_int::MAX as u32) as c_int
    };
    // No atomic mask swap here: an interrupt landing between unmask and poll
    // is only seen once the wait times out.
    // SAFETY: `pollfd` is a live, initialised pollfd.
    masked.unmasked(|| unsafe { libc::poll(pollfd, 1, timeout) })
}
