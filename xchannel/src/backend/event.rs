//! Event-backed backend for platforms with native asynchronous I/O.
//!
//! Transfers are issued as overlapped requests and the caller parks on the
//! request's manual-reset completion event. [`Backend::cancel_io`] sets that
//! event; the waiter then works out whether it woke for a close, a real
//! completion, or a bare cancel, and in the last case gets one idle-timeout
//! grace wait before failing.
//!
//! The handle must have been opened with `FILE_FLAG_OVERLAPPED`.

use core::cell::UnsafeCell;
use core::fmt;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::ptr;

use log::{debug, error, info, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, GetLastError, HANDLE, STATUS_PENDING, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForSingleObject,
};

use super::{Backend, OpState, Wakeup};
use crate::channel::Lifecycle;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};

/// One direction's overlapped descriptor and completion event.
///
/// The descriptor is boxed so its address stays fixed while the kernel holds
/// it, whatever happens to the channel.
struct Slot {
    overlapped: Box<UnsafeCell<OVERLAPPED>>,
    event: HANDLE,
    name: &'static str,
}

impl Slot {
    fn new(name: &'static str) -> Result<Self> {
        // SAFETY: manual-reset, initially clear, unnamed event.
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            // SAFETY: OVERLAPPED is plain data; all-zero is its initial state.
            overlapped: Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() })),
            event,
            name,
        })
    }

    /// Resets the descriptor for a new request.
    fn arm(&self) -> *mut OVERLAPPED {
        let overlapped = self.overlapped.get();
        // SAFETY: no request is in flight on this slot (one read and one
        // write at a time), so nothing else references the descriptor.
        unsafe {
            overlapped.write(std::mem::zeroed());
            (*overlapped).hEvent = self.event;
        }
        overlapped
    }

    fn has_completed(&self) -> bool {
        // SAFETY: `Internal` is updated by the kernel; read it volatile.
        let internal =
            unsafe { ptr::read_volatile(ptr::addr_of!((*self.overlapped.get()).Internal)) };
        internal != STATUS_PENDING as usize
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: the event was created in `Slot::new` and is closed once.
        unsafe {
            CloseHandle(self.event);
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("name", &self.name).finish()
    }
}

/// Backend for Windows handles opened for overlapped I/O.
#[derive(Debug)]
pub struct EventBackend {
    handle: OwnedHandle,
    read: Slot,
    write: Slot,
}

// SAFETY: the handle and events are usable from any thread; each descriptor
// is touched by at most one in-flight transfer at a time.
unsafe impl Send for EventBackend {}
// SAFETY: see above; `cancel_io` only signals events.
unsafe impl Sync for EventBackend {}

impl EventBackend {
    /// Takes ownership of `handle` and creates the completion events.
    pub fn open(handle: OwnedHandle, _config: &ChannelConfig) -> Result<Self> {
        Ok(Self {
            handle,
            read: Slot::new("Read")?,
            write: Slot::new("Write")?,
        })
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    fn transfer(
        &self,
        lifecycle: &Lifecycle,
        slot: &Slot,
        timeout_ms: u32,
        issue: impl FnOnce(*mut OVERLAPPED, &mut u32) -> i32,
    ) -> Result<usize> {
        let overlapped = slot.arm();
        let mut transferred = 0u32;
        if issue(overlapped, &mut transferred) != 0 {
            debug!("{} {} immediate data", slot.name, transferred);
            return Ok(transferred as usize);
        }
        // SAFETY: reads the calling thread's last error.
        let code = unsafe { GetLastError() };
        if code != ERROR_IO_PENDING {
            warn!("I/O is not pending, error {}", code);
            return Err(Error::from_os(code as i32));
        }

        // Issuing reset the event, so a close published just before it
        // would otherwise go unnoticed.
        let mut state = if lifecycle.is_closed() {
            debug!("Channel closed");
            self.abort(slot);
            OpState::Cancelled
        } else {
            OpState::start(lifecycle, timeout_ms)
        };
        while let Some((timeout_ms, lazy)) = state.wait() {
            state = self.wait_on_signal(lifecycle, slot, timeout_ms, lazy);
        }
        state.into_result()
    }

    fn wait_on_signal(
        &self,
        lifecycle: &Lifecycle,
        slot: &Slot,
        timeout_ms: u32,
        lazy: bool,
    ) -> OpState {
        debug!("Waiting for I/O for {}ms", timeout_ms);
        // SAFETY: the event is owned by the slot and open.
        let wait = unsafe { WaitForSingleObject(slot.event, timeout_ms) };
        if wait == WAIT_OBJECT_0 {
            let wakeup = match OpState::on_signal(lifecycle, lazy, slot.has_completed()) {
                Wakeup::Wait(next) => {
                    debug!(
                        "Event signalled without I/O completion, continuing with {:?}",
                        next
                    );
                    // SAFETY: as above.
                    unsafe {
                        ResetEvent(slot.event);
                    }
                    next.after_reset(lifecycle, slot.has_completed())
                }
                wakeup => wakeup,
            };
            return self.resolve(slot, wakeup);
        }
        if wait != WAIT_TIMEOUT {
            let err = Error::last_os_error();
            error!("Couldn't wait for I/O, error {}", err);
            self.abort(slot);
            return OpState::Failed(err);
        }

        debug!("Timeout elapsed");
        if OpState::closes_on_expiry(lifecycle, lazy) {
            info!("Closing channel on idle timeout");
            if let Err(err) = lifecycle.close(|| self.cancel_io()) {
                warn!("Couldn't close channel on idle timeout, error {}", err);
            }
        }
        if !lifecycle.is_closed() && slot.has_completed() {
            return self.complete(slot);
        }
        self.abort(slot);
        OpState::expired(lifecycle, timeout_ms, lazy)
    }

    fn resolve(&self, slot: &Slot, wakeup: Wakeup) -> OpState {
        match wakeup {
            Wakeup::Complete => self.complete(slot),
            Wakeup::Wait(next) => next,
            Wakeup::Abort(state) => {
                debug!("Aborting {} with {:?}", slot.name, state);
                self.abort(slot);
                state
            }
        }
    }

    /// Collects the byte count of a completed request.
    fn complete(&self, slot: &Slot) -> OpState {
        let mut transferred = 0u32;
        // SAFETY: the request on this slot has completed; the descriptor is live.
        if unsafe { GetOverlappedResult(self.raw(), slot.overlapped.get(), &mut transferred, 0) }
            == 0
        {
            let err = Error::last_os_error();
            error!("Couldn't complete overlapped {}, error {}", slot.name, err);
            self.abort(slot);
            return OpState::Failed(err);
        }
        OpState::Done(transferred as usize)
    }

    /// Cancels the request on `slot` and waits until the kernel releases it.
    fn abort(&self, slot: &Slot) {
        let overlapped = slot.overlapped.get();
        // SAFETY: handle and descriptor are live. A request that already
        // completed makes this fail with ERROR_NOT_FOUND, which is fine.
        unsafe {
            CancelIoEx(self.raw(), overlapped);
        }
        while !slot.has_completed() {
            // SAFETY: the event is open. The completion is re-checked after
            // the reset so a completion racing the reset is not missed.
            unsafe {
                ResetEvent(slot.event);
                if !slot.has_completed() {
                    WaitForSingleObject(slot.event, INFINITE);
                }
            }
        }
        let mut transferred = 0u32;
        // SAFETY: the request has completed.
        let ok = unsafe { GetOverlappedResult(self.raw(), overlapped, &mut transferred, 0) };
        if ok != 0 && transferred > 0 {
            warn!(
                "Discarding {} bytes of {} completed during cancellation",
                transferred, slot.name
            );
        }
    }
}

impl Backend for EventBackend {
    fn read(&self, lifecycle: &Lifecycle, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let handle = self.raw();
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let ptr = buf.as_mut_ptr();
        self.transfer(lifecycle, &self.read, timeout_ms, |overlapped, n| {
            // SAFETY: `buf` outlives the request: `transfer` does not return
            // until the request has completed or been drained.
            unsafe { ReadFile(handle, ptr, len, n, overlapped) }
        })
    }

    fn write(&self, lifecycle: &Lifecycle, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        let handle = self.raw();
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        self.transfer(lifecycle, &self.write, timeout_ms, |overlapped, n| {
            // SAFETY: as for `read`.
            unsafe { WriteFile(handle, buf.as_ptr(), len, n, overlapped) }
        })
    }

    fn flush(&self) -> Result<()> {
        // SAFETY: the handle is owned and open.
        if unsafe { FlushFileBuffers(self.raw()) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn cancel_io(&self) -> Result<()> {
        for slot in [&self.read, &self.write] {
            // SAFETY: the event is owned by the slot and open.
            if unsafe { SetEvent(slot.event) } == 0 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::error::ErrorKind;
    use std::fs::OpenOptions;
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::{FromRawHandle, RawHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};
    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::Storage::FileSystem::{FILE_FLAG_OVERLAPPED, PIPE_ACCESS_DUPLEX};
    use windows_sys::Win32::System::Pipes::{
        CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };

    /// Time for a spawned transfer to issue its request and park.
    const SETTLE: Duration = Duration::from_millis(100);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn overlapped_file() -> (Channel, tempfile::TempPath) {
        init_logger();
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(FILE_FLAG_OVERLAPPED)
            .open(&path)
            .unwrap();
        (Channel::open(OwnedHandle::from(file)).unwrap(), path)
    }

    /// Both ends of a fresh overlapped named pipe. Reads on a pipe stay
    /// pending until the peer writes.
    fn pipe_handles() -> (OwnedHandle, OwnedHandle) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        init_logger();
        let name = format!(
            r"\\.\pipe\xchannel-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        );
        let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        // SAFETY: `wide` is a NUL-terminated name; no security attributes.
        let server = unsafe {
            CreateNamedPipeW(
                wide.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                4096,
                4096,
                0,
                ptr::null(),
            )
        };
        assert_ne!(server, INVALID_HANDLE_VALUE);
        // SAFETY: the pipe handle was just created and nothing else owns it.
        let server = unsafe { OwnedHandle::from_raw_handle(server as RawHandle) };
        let client = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(FILE_FLAG_OVERLAPPED)
            .open(&name)
            .unwrap();
        (server, OwnedHandle::from(client))
    }

    fn named_pipe() -> (Channel, Channel) {
        let (server, client) = pipe_handles();
        (Channel::open(server).unwrap(), Channel::open(client).unwrap())
    }

    #[test]
    fn test_write_then_read_back() {
        let (channel, _path) = overlapped_file();
        assert_eq!(channel.write(b"hello", 1000).unwrap(), 5);
        assert!(channel.flush().is_ok());

        let mut buf = [0u8; 10];
        assert_eq!(channel.read(&mut buf, 1000).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_cancel_io_without_transfer_is_noop() {
        let (channel, _path) = overlapped_file();
        assert!(channel.cancel_io().is_ok());
        assert_eq!(channel.write(b"abc", 1000).unwrap(), 3);
    }

    #[test]
    fn test_read_after_close() {
        let (channel, _path) = overlapped_file();
        channel.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            channel.read(&mut buf, 1000).unwrap_err().kind(),
            ErrorKind::AlreadyClosed
        );
    }

    #[test]
    fn test_pending_read_completes() {
        let (server, client) = named_pipe();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(SETTLE);
                assert_eq!(client.write(b"late", 1000).unwrap(), 4);
            });
            let mut buf = [0u8; 10];
            assert_eq!(server.read(&mut buf, 10_000).unwrap(), 4);
            assert_eq!(&buf[..4], b"late");
        });
    }

    #[test]
    fn test_pending_read_times_out() {
        let (server, _client) = named_pipe();
        let mut buf = [0u8; 10];
        let start = Instant::now();
        let err = server.read(&mut buf, 50).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!server.is_closed());
    }

    #[test]
    fn test_cancel_io_wakes_pending_read() {
        let (server, _client) = named_pipe();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = [0u8; 10];
                let start = Instant::now();
                (server.read(&mut buf, 10_000), start.elapsed())
            });
            thread::sleep(SETTLE);
            server.cancel_io().unwrap();

            let (result, elapsed) = blocked.join().unwrap();
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
            assert!(elapsed < Duration::from_secs(5));
        });
        assert!(!server.is_closed());
    }

    #[test]
    fn test_close_wakes_pending_read() {
        let (server, _client) = named_pipe();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = [0u8; 10];
                server.read(&mut buf, 10_000)
            });
            thread::sleep(SETTLE);
            server.close().unwrap();
            assert_eq!(blocked.join().unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
        });
        assert!(server.is_closed());
    }

    #[test]
    fn test_lazy_close_bounds_pending_read() {
        let (server, _client) = named_pipe();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = [0u8; 10];
                let start = Instant::now();
                (server.read(&mut buf, 10_000), start.elapsed())
            });
            thread::sleep(SETTLE);
            server.lazy_close(50).unwrap();

            let (result, elapsed) = blocked.join().unwrap();
            assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
            assert!(elapsed < Duration::from_secs(5));
        });
        assert!(server.is_closed());
    }

    #[test]
    fn test_second_wake_during_idle_wait_cancels() {
        let (server, _client) = named_pipe();
        server.lazy_close(3000).unwrap();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = [0u8; 10];
                let start = Instant::now();
                (server.read(&mut buf, 10_000), start.elapsed())
            });
            thread::sleep(SETTLE);
            server.cancel_io().unwrap();

            let (result, elapsed) = blocked.join().unwrap();
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
            assert!(elapsed < Duration::from_secs(2));
        });
        assert!(!server.is_closed());
    }

    #[test]
    fn test_lazy_close_then_cancel_io_cancels() {
        let (server, _client) = named_pipe();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut buf = [0u8; 10];
                let start = Instant::now();
                (server.read(&mut buf, 10_000), start.elapsed())
            });
            thread::sleep(SETTLE);
            // First wake: downgrade to the 3s idle wait.
            server.lazy_close(3000).unwrap();
            thread::sleep(SETTLE);
            // Second wake during the idle wait.
            server.cancel_io().unwrap();

            let (result, elapsed) = blocked.join().unwrap();
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
            assert!(elapsed < Duration::from_secs(2));
        });
        assert!(!server.is_closed());
    }

    #[test]
    fn test_close_before_wait_cancels_issued_read() {
        let (server, _client) = pipe_handles();
        let backend = EventBackend::open(server, &ChannelConfig::new()).unwrap();
        let lifecycle = Lifecycle::new();
        lifecycle.close(|| Ok(())).unwrap();

        let mut buf = [0u8; 10];
        let start = Instant::now();
        let err = backend.read(&lifecycle, &mut buf, 10_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_short_timeout_under_lazy_close_keeps_channel_open() {
        let (server, _client) = named_pipe();
        server.lazy_close(5000).unwrap();
        let mut buf = [0u8; 10];
        let err = server.read(&mut buf, 20).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(!server.is_closed());
    }
}
