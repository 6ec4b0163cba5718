//! Reader/writer lock for the device's init state.
//!
//! Read mode is taken for any operation that requires the device to already
//! be initialised (read, write, discard, stats); write mode is taken only
//! for `init`, `reset`, `disksize` and `backing_dev` changes — operations
//! that are rare and must see no concurrent readers.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicIsize, AtomicU32, Ordering};

const WRITER: isize = -1;

/// Writer-preferring: `write()` signals intent via `writer_waiting` before
/// spinning, and `read()` yields to a waiting writer rather than keep
/// acquiring, so continuous read traffic can't starve a writer out
/// indefinitely.
pub struct TicketRwLock<T> {
    state: AtomicIsize,
    writer_waiting: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TicketRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for TicketRwLock<T> {}

pub struct ReadGuard<'a, T> {
    lock: &'a TicketRwLock<T>,
}

pub struct WriteGuard<'a, T> {
    lock: &'a TicketRwLock<T>,
}

impl<T> TicketRwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicIsize::new(0),
            writer_waiting: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            // Yield to a waiting writer: don't acquire read if one is
            // queued, even though the lock is technically free for reading.
            if current != WRITER && self.writer_waiting.load(Ordering::Relaxed) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return ReadGuard { lock: self };
                }
            }
            spin_loop();
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        // Signal intent so new readers yield, then spin for exclusive access.
        self.writer_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_waiting.fetch_sub(1, Ordering::Relaxed);
                return WriteGuard { lock: self };
            }
            spin_loop();
        }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding any read ticket guarantees no writer is active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: WRITER state is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: WRITER state is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_can_overlap() {
        let lock = Arc::new(TicketRwLock::new(42));
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = Arc::new(TicketRwLock::new(0u64));
        let mut handles = Vec::new();
        for i in 0..4u64 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                let mut w = lock.write();
                *w += i + 1;
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 1 + 2 + 3 + 4);
    }

    #[test]
    fn waiting_writer_is_not_starved_by_continuous_readers() {
        use std::sync::atomic::AtomicBool;

        let lock = Arc::new(TicketRwLock::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _r = lock.read();
                }
            }));
        }

        // Give the readers a head start so they're actively contending
        // before the writer signals intent.
        thread::yield_now();
        let writer_lock = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let mut w = writer_lock.write();
            *w = 99;
        });
        writer.join().unwrap();

        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(*lock.read(), 99);
    }
}
