//! Ticket-based mutual exclusion.
//!
//! Same algorithm as the kernel-side `IrqMutex` this crate's lineage uses:
//! each acquirer takes a monotonically increasing ticket and spins until
//! `now_serving` matches, giving FIFO fairness under contention. Unlike the
//! kernel version there is no interrupt/preemption state to save — outside a
//! kernel "don't get preempted while holding the lock" isn't something we
//! can promise or need to; the OS scheduler handles fairness for us, the
//! ticket order just keeps waiters from starving each other.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A ticket-lock mutex. Used for locks that are held for O(1) work:
/// the writeback-limit lock and the device registry.
pub struct TicketLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    poisoned: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only possible through a guard obtained while
// holding the ticket, which provides exclusive access.
unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            poisoned: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// True if a prior holder panicked while holding the lock. The data may
    /// be left in an inconsistent state; callers that care should check this
    /// before trusting invariants.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving);
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }
        TicketLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(TicketLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.poisoned.store(true, Ordering::Release);
        }
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a ticket that matches `now_serving` grants
        // exclusive access until the guard drops and advances it.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see Deref.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn excludes_concurrent_writers() {
        let lock = Arc::new(TicketLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = TicketLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
