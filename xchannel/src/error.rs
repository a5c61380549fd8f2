//! Error vocabulary shared by both backends.
//!
//! Semantic failures carry the same logical value on every platform; any
//! other OS code is passed through untouched as [`ErrorKind::Os`].

use core::fmt;
use std::cell::Cell;

#[cfg(unix)]
mod codes {
    pub const CANCELLED: i32 = libc::ECANCELED;
    pub const TIMED_OUT: i32 = libc::ETIMEDOUT;
    pub const NOT_FOUND: i32 = libc::ENOENT;

    pub fn is_cancelled(code: i32) -> bool {
        code == CANCELLED
    }
}

#[cfg(windows)]
mod codes {
    use windows_sys::Win32::Foundation::{
        ERROR_CANCELLED, ERROR_FILE_NOT_FOUND, ERROR_OPERATION_ABORTED, ERROR_TIMEOUT,
    };

    pub const CANCELLED: i32 = ERROR_CANCELLED as i32;
    pub const TIMED_OUT: i32 = ERROR_TIMEOUT as i32;
    pub const NOT_FOUND: i32 = ERROR_FILE_NOT_FOUND as i32;

    pub fn is_cancelled(code: i32) -> bool {
        code == CANCELLED || code == ERROR_OPERATION_ABORTED as i32
    }
}

/// Category of a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation was aborted by a close, lazy close or explicit cancel.
    Cancelled,
    /// The bound elapsed with no completion and no cancellation.
    TimedOut,
    /// The underlying object does not exist.
    NotFound,
    /// The operation was attempted after the channel was closed.
    AlreadyClosed,
    /// Any other native OS error; see [`Error::code`].
    Os,
}

/// A channel error: a kind plus the platform code that reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    code: i32,
}

impl Error {
    /// Creates an error of a semantic kind with its platform code.
    ///
    /// `ErrorKind::Os` has no canonical code; use [`Error::from_os`] for it.
    pub fn new(kind: ErrorKind) -> Self {
        let code = match kind {
            ErrorKind::Cancelled | ErrorKind::AlreadyClosed => codes::CANCELLED,
            ErrorKind::TimedOut => codes::TIMED_OUT,
            ErrorKind::NotFound => codes::NOT_FOUND,
            ErrorKind::Os => 0,
        };
        Error { kind, code }
    }

    /// Maps a native error code onto the shared vocabulary.
    pub fn from_os(code: i32) -> Self {
        let kind = if codes::is_cancelled(code) {
            ErrorKind::Cancelled
        } else if code == codes::TIMED_OUT {
            ErrorKind::TimedOut
        } else if code == codes::NOT_FOUND {
            ErrorKind::NotFound
        } else {
            ErrorKind::Os
        };
        Error { kind, code }
    }

    /// Captures the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        Self::from_os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Shorthand for `Error::new(ErrorKind::Cancelled)`.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Shorthand for `Error::new(ErrorKind::TimedOut)`.
    pub fn timed_out() -> Self {
        Self::new(ErrorKind::TimedOut)
    }

    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the platform error code.
    pub fn code(&self) -> i32 {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Cancelled => write!(f, "Operation cancelled"),
            ErrorKind::TimedOut => write!(f, "Operation timed out"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::AlreadyClosed => write!(f, "Channel already closed"),
            ErrorKind::Os => write!(
                f,
                "OS error {}: {}",
                self.code,
                std::io::Error::from_raw_os_error(self.code)
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        let kind = match err.kind {
            ErrorKind::Cancelled => std::io::ErrorKind::ConnectionAborted,
            ErrorKind::TimedOut => std::io::ErrorKind::TimedOut,
            ErrorKind::NotFound => std::io::ErrorKind::NotFound,
            ErrorKind::AlreadyClosed => std::io::ErrorKind::NotConnected,
            ErrorKind::Os => return std::io::Error::from_raw_os_error(err.code),
        };
        std::io::Error::new(kind, err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: Cell<Option<Error>> = const { Cell::new(None) };
}

/// Returns the error recorded by the last failing channel call on this thread.
///
/// Successful calls leave the value untouched.
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn record<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        LAST_ERROR.with(|slot| slot.set(Some(*err)));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_codes_round_trip() {
        for kind in [ErrorKind::Cancelled, ErrorKind::TimedOut, ErrorKind::NotFound] {
            let err = Error::new(kind);
            assert_eq!(Error::from_os(err.code()).kind(), kind);
        }
    }

    #[test]
    fn test_already_closed_reports_cancelled_code() {
        let err = Error::new(ErrorKind::AlreadyClosed);
        assert_eq!(err.code(), Error::cancelled().code());
        assert_eq!(Error::from_os(err.code()).kind(), ErrorKind::Cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_code_passes_through() {
        let err = Error::from_os(libc::EPIPE);
        assert_eq!(err.kind(), ErrorKind::Os);
        assert_eq!(err.code(), libc::EPIPE);
        let io: std::io::Error = err.into();
        assert_eq!(io.raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn test_io_error_kinds() {
        let io: std::io::Error = Error::timed_out().into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        let io: std::io::Error = Error::cancelled().into();
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionAborted);
        let io: std::io::Error = Error::new(ErrorKind::AlreadyClosed).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_last_error_is_per_thread() {
        let _ = record::<()>(Err(Error::timed_out()));
        assert_eq!(last_error(), Some(Error::timed_out()));

        let _ = record(Ok(1usize));
        assert_eq!(last_error(), Some(Error::timed_out()));

        let other = std::thread::spawn(last_error).join().unwrap();
        assert_eq!(other, None);
    }
}
