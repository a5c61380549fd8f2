//! # XChannel - Timeout-capable I/O Channels
//!
//! XChannel wraps one already-open OS handle (a pipe end, a socket, a file)
//! and gives it a small, strict contract:
//!
//! - **Bounded-time transfers**: every `read`/`write` takes a timeout
//! - **Safe cancellation**: another thread can abort an in-flight transfer
//! - **Lazy close**: an idle channel closes itself without racing active I/O
//! - **One error vocabulary**: `Cancelled`, `TimedOut`, `NotFound` map to the
//!   same logical value on every platform; other OS codes pass through
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                         Channel                          │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │  Lifecycle  │ │ Closing Lock│ │   Last Error    │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Backend (build-time)                    │
//! │  ┌──────────────────────────┐ ┌───────────────────────┐ │
//! │  │ Interrupt (Unix, ppoll + │ │ Event (Windows,       │ │
//! │  │ pthread_kill)            │ │ overlapped I/O)       │ │
//! │  └──────────────────────────┘ └───────────────────────┘ │
//! ├─────────────────────────────────────────────────────────┤
//! │                 OS handle (fd / HANDLE)                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xchannel::Channel;
//!
//! let channel = Channel::open(fd)?;
//! channel.write(b"hello", 1000)?;
//!
//! // Drop the peer if nothing arrives within 50ms
//! channel.lazy_close(50)?;
//! let mut buf = [0u8; 64];
//! let n = channel.read(&mut buf, 5000)?;
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod channel;
pub mod closing;
pub mod config;
pub mod error;
pub mod io;

pub use backend::{Backend, NativeBackend, OsHandle};
pub use channel::{Channel, ChannelState, Lifecycle};
pub use config::ChannelConfig;
pub use error::{Error, ErrorKind, Result, last_error};

/// Default timeout used by the `std::io` adapters, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Caller timeout meaning "wait without bound".
pub const TIMEOUT_INFINITE: u32 = u32::MAX;
