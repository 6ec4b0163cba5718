//! Reference [`PoolAllocator`]: a size-classed slab, loosely modeled on
//! zsmalloc's size classes (not a port — just enough buckets to keep
//! fragmentation reasonable for compressed pages up to one host page).

use std::sync::atomic::{AtomicUsize, Ordering};

use zram_sync::TicketLock;

use crate::{AllocMode, MapMode, MappedSlice, PoolAllocator, PoolHandle};

/// Size classes in bytes, smallest to largest. The last class always
/// equals `page_size` — huge (incompressible) pages are stored raw at a
/// full page, which is larger than the huge-class *threshold* itself.
fn class_sizes(page_size: usize) -> Vec<usize> {
    let mut sizes = vec![32, 48, 64, 96, 128, 176, 240, 328, 448, 576, 768, 1024, 1344, 1792, 2368, 3072];
    sizes.retain(|&s| s < page_size);
    sizes.push(page_size);
    sizes
}

struct ArenaClass {
    slot_size: usize,
    /// Slabs already carved out. Growing this Vec moves `Box` pointers,
    /// never the underlying heap bytes a handle points at, so handles
    /// remain valid across growth.
    slots: TicketLock<Vec<Box<[u8]>>>,
    free_list: TicketLock<Vec<u32>>,
    /// Slabs obtainable without `AllocMode::Blocking`.
    reserved: usize,
}

impl ArenaClass {
    fn new(slot_size: usize, reserved: usize) -> Self {
        Self {
            slot_size,
            slots: TicketLock::new(Vec::new()),
            free_list: TicketLock::new(Vec::new()),
            reserved,
        }
    }

    fn alloc(&self, mode: AllocMode) -> Option<u32> {
        if let Some(index) = self.free_list.lock().pop() {
            return Some(index);
        }
        let mut slots = self.slots.lock();
        if slots.len() < self.reserved || mode == AllocMode::Blocking {
            let index = slots.len() as u32;
            slots.push(vec![0u8; self.slot_size].into_boxed_slice());
            Some(index)
        } else {
            None
        }
    }

    fn free(&self, index: u32) {
        self.free_list.lock().push(index);
    }

    /// # Safety
    /// `index` must currently be allocated (not on the free list) and the
    /// caller must not hold any other live mapping of the same handle.
    unsafe fn slice_ptr(&self, index: u32) -> (*mut u8, usize) {
        let slots = self.slots.lock();
        let slot = &slots[index as usize];
        (slot.as_ptr() as *mut u8, slot.len())
    }
}

/// A reference memory pool: one [`ArenaClass`] per size bucket, each
/// pre-reserving a handful of slabs so a burst of allocations can succeed
/// without ever calling back into `AllocMode::Blocking`.
pub struct ArenaPool {
    classes: Vec<ArenaClass>,
    huge_class_size: usize,
    used_bytes: AtomicUsize,
    max_bytes: Option<usize>,
}

const DEFAULT_RESERVE_PER_CLASS: usize = 4;

impl ArenaPool {
    /// `huge_class_size` is the threshold at/above which a page is stored
    /// raw rather than compressed — this is pure metadata
    /// returned by `huge_class_size()`, since the store engine decides
    /// huge-ness by comparing a compressed length against it. The pool's
    /// own largest size class is always `zram_abi::PAGE_SIZE`, since a
    /// huge page's raw bytes must fit somewhere. `max_bytes` models a hard
    /// ceiling on the pool's total backing storage; `None` means
    /// unbounded (still subject to the device's own `mem_limit`, checked
    /// one layer up by the store engine).
    pub fn new(huge_class_size: usize, max_bytes: Option<usize>) -> Self {
        let classes = class_sizes(zram_abi::PAGE_SIZE)
            .into_iter()
            .map(|size| ArenaClass::new(size, DEFAULT_RESERVE_PER_CLASS))
            .collect();
        Self {
            classes,
            huge_class_size,
            used_bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    fn class_index_for(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.slot_size >= size)
    }
}

impl PoolAllocator for ArenaPool {
    fn alloc(&self, size: usize, mode: AllocMode) -> Option<PoolHandle> {
        let class = self.class_index_for(size)?;
        let slot_size = self.classes[class].slot_size;

        if let Some(max) = self.max_bytes {
            if self.used_bytes.load(Ordering::Relaxed) + slot_size > max {
                tracing::debug!(size, max, "pool allocation rejected: mem_limit reached");
                return None;
            }
        }

        let index = self.classes[class].alloc(mode)?;
        self.used_bytes.fetch_add(slot_size, Ordering::Relaxed);
        Some(PoolHandle {
            class: class as u8,
            index,
        })
    }

    fn free(&self, handle: PoolHandle) {
        let class = &self.classes[handle.class as usize];
        class.free(handle.index);
        self.used_bytes
            .fetch_sub(class.slot_size, Ordering::Relaxed);
    }

    fn map(&self, handle: PoolHandle, mode: MapMode) -> MappedSlice<'_> {
        let class = &self.classes[handle.class as usize];
        // SAFETY: the caller owns `handle` (not freed), and slab bytes are
        // stable for the handle's lifetime as documented on `slice_ptr`.
        let (ptr, len) = unsafe { class.slice_ptr(handle.index) };
        match mode {
            MapMode::Read => MappedSlice::Read(unsafe { std::slice::from_raw_parts(ptr, len) }),
            MapMode::Write => {
                MappedSlice::Write(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
            }
        }
    }

    fn unmap(&self, _handle: PoolHandle) {
        // No kernel mapping to tear down in the reference pool.
    }

    fn total_pages(&self) -> usize {
        self.used_bytes
            .load(Ordering::Relaxed)
            .div_ceil(zram_abi::PAGE_SIZE)
    }

    fn huge_class_size(&self) -> usize {
        self.huge_class_size
    }

    fn compact(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let pool = ArenaPool::new(3584, None);
        let handle = pool.alloc(100, AllocMode::NonBlocking).unwrap();
        {
            let mut w = pool.map(handle, MapMode::Write);
            w[..5].copy_from_slice(b"hello");
        }
        {
            let r = pool.map(handle, MapMode::Read);
            assert_eq!(&r[..5], b"hello");
        }
        pool.unmap(handle);
        pool.free(handle);
    }

    #[test]
    fn reserve_exhaustion_requires_blocking() {
        let pool = ArenaPool::new(3584, None);
        let mut handles = Vec::new();
        for _ in 0..DEFAULT_RESERVE_PER_CLASS {
            handles.push(pool.alloc(32, AllocMode::NonBlocking).unwrap());
        }
        assert!(pool.alloc(32, AllocMode::NonBlocking).is_none());
        let grown = pool.alloc(32, AllocMode::Blocking);
        assert!(grown.is_some());
    }

    #[test]
    fn max_bytes_is_a_hard_ceiling() {
        let pool = ArenaPool::new(3584, Some(64));
        assert!(pool.alloc(32, AllocMode::Blocking).is_some());
        assert!(pool.alloc(32, AllocMode::Blocking).is_some());
        assert!(pool.alloc(32, AllocMode::Blocking).is_none());
    }

    #[test]
    fn huge_class_routes_to_last_bucket() {
        let pool = ArenaPool::new(3584, None);
        let handle = pool.alloc(4096, AllocMode::Blocking).unwrap();
        assert_eq!(pool.map(handle, MapMode::Read).len(), 4096);
    }
}
