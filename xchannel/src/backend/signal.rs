//! Thread identity and interrupt delivery for the interrupt backend.
//!
//! A cancel is a signal sent to one specific thread. The handler does nothing;
//! its only effect is to make the thread's blocking wait fail with `EINTR`.

use core::fmt;
use std::ptr;

use libc::c_int;
use parking_lot::Mutex;

use crate::error::{Error, Result};

static INSTALLED: Mutex<Vec<c_int>> = Mutex::new(Vec::new());

extern "C" fn on_interrupt(_signal: c_int) {}

/// Installs the no-op interrupt handler for `signal` (idempotent).
///
/// `SA_RESTART` is left clear so blocking calls report the interruption.
pub(crate) fn install(signal: c_int) -> Result<()> {
    let mut installed = INSTALLED.lock();
    if installed.contains(&signal) {
        return Ok(());
    }
    // SAFETY: the action is fully initialised before use and the handler is
    // async-signal-safe (it does nothing).
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_interrupt as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(Error::last_os_error());
        }
    }
    installed.push(signal);
    Ok(())
}

/// Identity of a thread that can be interrupted.
#[derive(Clone, Copy)]
pub(crate) struct ThreadRef(libc::pthread_t);

// SAFETY: a pthread_t is an opaque identifier; it is only passed back to
// pthread_kill while the owning thread is known to be alive.
unsafe impl Send for ThreadRef {}

impl ThreadRef {
    pub(crate) fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        Self(unsafe { libc::pthread_self() })
    }

    /// Delivers `signal` to the thread.
    pub(crate) fn interrupt(self, signal: c_int) -> Result<()> {
        // SAFETY: callers guarantee the thread has not exited.
        match unsafe { libc::pthread_kill(self.0, signal) } {
            0 => Ok(()),
            code => Err(Error::from_os(code)),
        }
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThreadRef")
    }
}

/// Keeps `signal` blocked on the calling thread until dropped.
///
/// While blocked, an interrupt stays pending instead of being lost; the
/// readiness wait opens it atomically.
pub(crate) struct Masked {
    previous: libc::sigset_t,
    signal: c_int,
}

impl Masked {
    pub(crate) fn block(signal: c_int) -> Result<Self> {
        // SAFETY: both sets are initialised by sigemptyset/pthread_sigmask
        // before they are read.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            let mut previous: libc::sigset_t = std::mem::zeroed();
            match libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) {
                0 => Ok(Self { previous, signal }),
                code => Err(Error::from_os(code)),
            }
        }
    }

    /// The mask to wait under: the thread's own mask with `signal` open.
    pub(crate) fn wait_mask(&self) -> libc::sigset_t {
        let mut mask = self.previous;
        // SAFETY: `mask` is a valid, initialised signal set.
        unsafe {
            libc::sigdelset(&mut mask, self.signal);
        }
        mask
    }

    /// Runs `f` with the signal unblocked.
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    pub(crate) fn unmasked<T>(&self, f: impl FnOnce() -> T) -> T {
        let mask = self.wait_mask();
        let mut blocked = mask;
        // SAFETY: both sets are valid; failure leaves the mask unchanged,
        // which only delays the interrupt until the wait times out.
        unsafe {
            libc::sigaddset(&mut blocked, self.signal);
            libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
        }
        let result = f();
        // SAFETY: as above.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &blocked, ptr::null_mut());
        }
        result
    }
}

impl Drop for Masked {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured in `block`. A pending interrupt
        // is delivered here and handled by the no-op handler.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install(libc::SIGUSR2).unwrap();
        install(libc::SIGUSR2).unwrap();
        assert_eq!(
            INSTALLED.lock().iter().filter(|&&s| s == libc::SIGUSR2).count(),
            1
        );
    }

    #[test]
    fn test_masked_interrupt_stays_pending() {
        install(libc::SIGUSR2).unwrap();
        let masked = Masked::block(libc::SIGUSR2).unwrap();
        ThreadRef::current().interrupt(libc::SIGUSR2).unwrap();

        // SAFETY: `pending` is initialised by sigpending.
        let is_pending = unsafe {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigpending(&mut pending);
            libc::sigismember(&pending, libc::SIGUSR2) == 1
        };
        assert!(is_pending);

        let wait_mask = masked.wait_mask();
        // SAFETY: `wait_mask` is a valid signal set.
        assert_eq!(unsafe { libc::sigismember(&wait_mask, libc::SIGUSR2) }, 0);
        drop(masked);
    }
}
