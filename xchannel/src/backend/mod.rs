//! Platform backends.
//!
//! A backend performs one bounded transfer against the owned handle and knows
//! how to abort it from another thread. The implementation is picked at build
//! time:
//!
//! - `InterruptBackend` (Unix): readiness wait plus non-blocking transfer; a
//!   cancel interrupts the blocked thread with a signal
//! - `EventBackend` (Windows): overlapped I/O; a cancel sets the completion
//!   event the waiter is parked on

use crate::channel::Lifecycle;
use crate::error::{Error, Result};

#[cfg(unix)]
mod interrupt;
#[cfg(unix)]
mod signal;

#[cfg(windows)]
mod event;

#[cfg(unix)]
pub use interrupt::InterruptBackend;

#[cfg(windows)]
pub use event::EventBackend;

/// The backend used by [`Channel::open`](crate::Channel::open) on this platform.
#[cfg(unix)]
pub type NativeBackend = InterruptBackend;

/// The backend used by [`Channel::open`](crate::Channel::open) on this platform.
#[cfg(windows)]
pub type NativeBackend = EventBackend;

/// The owned OS handle a channel wraps.
#[cfg(unix)]
pub type OsHandle = std::os::fd::OwnedFd;

/// The owned OS handle a channel wraps.
#[cfg(windows)]
pub type OsHandle = std::os::windows::io::OwnedHandle;

/// Transfer engine behind a [`Channel`](crate::Channel).
///
/// `read`/`write` block the caller until completion, timeout or
/// cancellation. They consult `lifecycle` for the closed flag and the idle
/// timeout, and close it themselves when an idle timeout expires.
pub trait Backend: Send + Sync {
    /// Reads into `buf`, waiting at most `timeout_ms`.
    fn read(&self, lifecycle: &Lifecycle, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;

    /// Writes from `buf`, waiting at most `timeout_ms`.
    fn write(&self, lifecycle: &Lifecycle, buf: &[u8], timeout_ms: u32) -> Result<usize>;

    /// Forces buffered data to the underlying medium.
    fn flush(&self) -> Result<()>;

    /// Aborts the in-flight transfer, if any.
    fn cancel_io(&self) -> Result<()>;
}

/// Progress of one transfer through a backend's wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Waiting under the caller's timeout (already capped by an armed idle
    /// timeout).
    WaitingForCompletion { timeout_ms: u32 },
    /// Waiting under the idle timeout: a lazy wait. A zero timeout means no
    /// idle window is armed and the transfer only gets a completion re-check.
    WaitingIdle { timeout_ms: u32 },
    /// Transferred this many bytes.
    Done(usize),
    Cancelled,
    TimedOut,
    Failed(Error),
}

/// What an event-backed waiter does after its event fired.
#[cfg(any(windows, test))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// The request finished; collect its result.
    Complete,
    /// Abort the request and finish in this state.
    Abort(OpState),
    /// Reset the event and keep waiting in this state.
    Wait(OpState),
}

impl OpState {
    /// The first wait state for a transfer that asked for `timeout_ms`.
    ///
    /// The wait is lazy only when the idle timeout is the bound that
    /// applies; a shorter caller timeout expiring is not idleness.
    pub(crate) fn start(lifecycle: &Lifecycle, timeout_ms: u32) -> Self {
        match lifecycle.idle_timeout_ms() {
            Some(idle) if idle <= timeout_ms => OpState::WaitingIdle { timeout_ms: idle },
            _ => OpState::WaitingForCompletion { timeout_ms },
        }
    }

    /// The wait state entered after a wake-up without completion.
    pub(crate) fn idle(lifecycle: &Lifecycle) -> Self {
        OpState::WaitingIdle {
            timeout_ms: lifecycle.idle_timeout_ms().unwrap_or(0),
        }
    }

    /// The wait to perform next, as `(timeout_ms, lazy)`, or `None` once the
    /// transfer has finished.
    pub(crate) fn wait(&self) -> Option<(u32, bool)> {
        match *self {
            OpState::WaitingForCompletion { timeout_ms } => Some((timeout_ms, false)),
            OpState::WaitingIdle { timeout_ms } => Some((timeout_ms, true)),
            _ => None,
        }
    }

    /// Whether an expired wait means the channel sat idle for the whole
    /// idle window and must close.
    pub(crate) fn closes_on_expiry(lifecycle: &Lifecycle, lazy: bool) -> bool {
        lazy && lifecycle.idle_timeout_ms().is_some()
    }

    /// The final state of a wait that expired without completion.
    ///
    /// A zero-length lazy wait with nothing armed is the re-check after a
    /// bare cancel, so it reports the cancel.
    pub(crate) fn expired(lifecycle: &Lifecycle, timeout_ms: u32, lazy: bool) -> Self {
        if lazy && timeout_ms == 0 && lifecycle.idle_timeout_ms().is_none() {
            OpState::Cancelled
        } else {
            OpState::TimedOut
        }
    }

    /// Decides what a fired completion event means.
    ///
    /// A close always wins. Without a real completion, the first wake-up
    /// downgrades to the idle timeout and a second one, during the lazy
    /// wait, fails.
    #[cfg(any(windows, test))]
    pub(crate) fn on_signal(lifecycle: &Lifecycle, lazy: bool, completed: bool) -> Wakeup {
        if lifecycle.is_closed() {
            Wakeup::Abort(OpState::Cancelled)
        } else if completed {
            Wakeup::Complete
        } else if lazy {
            Wakeup::Abort(OpState::Cancelled)
        } else {
            Wakeup::Wait(OpState::idle(lifecycle))
        }
    }

    /// Re-checks after the event was reset: a close or completion that
    /// signalled between the decision and the reset is not lost.
    #[cfg(any(windows, test))]
    pub(crate) fn after_reset(self, lifecycle: &Lifecycle, completed: bool) -> Wakeup {
        if lifecycle.is_closed() {
            Wakeup::Abort(OpState::Cancelled)
        } else if completed {
            Wakeup::Complete
        } else {
            Wakeup::Wait(self)
        }
    }

    /// Turns the state into the caller's result. A transfer abandoned while
    /// still waiting counts as cancelled.
    pub(crate) fn into_result(self) -> Result<usize> {
        match self {
            OpState::Done(n) => Ok(n),
            OpState::TimedOut => Err(Error::timed_out()),
            OpState::Failed(err) => Err(err),
            OpState::Cancelled
            | OpState::WaitingForCompletion { .. }
            | OpState::WaitingIdle { .. } => Err(Error::cancelled()),
        }
    }
}
