//! The process-wide closing lock.
//!
//! Every close and lazy-close transition, on every channel, runs under this
//! one lock. It guards only the `closed`/idle-timeout bookkeeping and the
//! cancellation request that publishes it; data transfer never takes it.

use parking_lot::{Mutex, MutexGuard};

static CLOSING: Mutex<()> = Mutex::new(());

/// Acquires the closing lock, blocking until it is available.
pub fn lock() -> MutexGuard<'static, ()> {
    CLOSING.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closing_lock_serializes() {
        static INSIDE: AtomicUsize = AtomicUsize::new(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..100 {
                        let _guard = lock();
                        assert_eq!(INSIDE.fetch_add(1, Ordering::SeqCst), 0);
                        INSIDE.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
