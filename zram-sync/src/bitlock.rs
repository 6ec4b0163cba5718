//! A single test-and-set lock bit embedded inside a larger atomic word.
//!
//! This is the primitive the slot table design calls for: the slot table cannot
//! afford a full lock object per slot, so the lock *is* one bit of the same
//! word that carries the flags, size and idle counter. `acquire`/`release`
//! operate directly on the caller's `AtomicU32`, touching only `bit`; every
//! other bit is left exactly as the last successful CAS left it, so readers
//! of those bits elsewhere must still go through the lock.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Spin until `bit` is clear in `word`, then set it. Returns the word value
/// observed immediately before the bit was set (i.e. with the lock bit
/// still logically 0), so the caller can decode the other fields without a
/// second load racing a concurrent unlock.
#[inline]
pub fn acquire(word: &AtomicU32, bit: u32) -> u32 {
    let mask = 1u32 << bit;
    loop {
        let before = word.fetch_or(mask, Ordering::Acquire);
        if before & mask == 0 {
            return before;
        }
        while word.load(Ordering::Relaxed) & mask != 0 {
            spin_loop();
        }
    }
}

/// Try once to set `bit`. Returns `Some(pre-lock value)` on success.
#[inline]
pub fn try_acquire(word: &AtomicU32, bit: u32) -> Option<u32> {
    let mask = 1u32 << bit;
    let before = word.fetch_or(mask, Ordering::Acquire);
    if before & mask == 0 {
        Some(before)
    } else {
        None
    }
}

/// Clear `bit`. Caller must hold it.
#[inline]
pub fn release(word: &AtomicU32, bit: u32) {
    let mask = 1u32 << bit;
    word.fetch_and(!mask, Ordering::Release);
}

/// True if `bit` is currently set (advisory only — no lock held).
#[inline]
pub fn is_locked(word: &AtomicU32, bit: u32) -> bool {
    word.load(Ordering::Relaxed) & (1u32 << bit) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let word = Arc::clone(&word);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    acquire(&word, 0);
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    release(&word, 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn try_acquire_fails_while_locked() {
        let word = AtomicU32::new(0);
        acquire(&word, 3);
        assert!(try_acquire(&word, 3).is_none());
        release(&word, 3);
        assert!(try_acquire(&word, 3).is_some());
    }
}
