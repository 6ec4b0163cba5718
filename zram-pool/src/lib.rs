//! Memory pool adapter.
//!
//! The store engine only ever talks to the [`PoolAllocator`] trait. This
//! crate also ships [`ArenaPool`], a reference implementation good enough
//! to drive the store/writeback engines and their tests; a kernel glue
//! layer would instead bind this trait to something like zsmalloc.

mod arena;

use zram_abi::ZramResult;

pub use arena::ArenaPool;

/// Whether an allocation is allowed to grow the pool's backing storage
/// ("may sleep to get more memory") or must succeed out of what's already
/// reserved. Mirrors the store engine's two-phase allocation discipline:
/// try `NonBlocking` first, recompress and retry `Blocking` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    NonBlocking,
    Blocking,
}

/// Opaque handle into the pool. Only meaningful to the `PoolAllocator` that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHandle {
    pub(crate) class: u8,
    pub(crate) index: u32,
}

impl PoolHandle {
    /// Construct a handle directly. Only `PoolAllocator` implementations
    /// should normally do this; exposed so that other adapters (e.g. the
    /// dedup index) can build fixtures without depending on a concrete
    /// allocator in their own tests.
    pub fn from_raw(class: u8, index: u32) -> Self {
        Self { class, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// Contract over an external slab allocator.
///
/// Implementations must guarantee that a handle's bytes are stable for the
/// handle's entire lifetime (`alloc` to matching `free`) — the store engine
/// maps, copies, and unmaps without holding any lock across the copy, and
/// relies on the mapped slice staying valid.
pub trait PoolAllocator: Send + Sync {
    /// Request `size` bytes. Returns `None` on allocation failure — under
    /// `NonBlocking` this may simply mean "would need to sleep/grow";
    /// under `Blocking` it means the pool is genuinely exhausted.
    fn alloc(&self, size: usize, mode: AllocMode) -> Option<PoolHandle>;

    /// Release a handle. Must not be called twice for the same handle.
    fn free(&self, handle: PoolHandle);

    /// Map a handle's storage for read or write access. The returned slice
    /// is exactly the class size the handle was allocated from, which may
    /// be larger than the requested `size` — callers must track their own
    /// logical length (the slot table's `size` field does this).
    fn map(&self, handle: PoolHandle, mode: MapMode) -> MappedSlice<'_>;

    /// Symmetry with `map`; the reference pool's mapping is just a raw
    /// pointer so this is a no-op, but callers must still call it (a
    /// kernel-backed implementation may need to tear down a kmap).
    fn unmap(&self, handle: PoolHandle);

    /// Total pages (PAGE_SIZE-sized units) of storage currently handed out.
    fn total_pages(&self) -> usize;

    /// Threshold at or above which compressing a page is not worth it —
    /// queried once at pool creation and cached by callers.
    fn huge_class_size(&self) -> usize;

    /// Best-effort compaction; returns pages reclaimed. The reference pool
    /// cannot actually defragment its size-classed slabs (no page
    /// remapping primitive here) so it always reports 0, but the call
    /// still releases slots sitting only on free-lists back to the
    /// allocator's global accounting where possible.
    fn compact(&self) -> usize;
}

/// A mapped view over a handle's storage. Lifetime-bound to the pool.
pub enum MappedSlice<'a> {
    Read(&'a [u8]),
    Write(&'a mut [u8]),
}

impl core::ops::Deref for MappedSlice<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            MappedSlice::Read(s) => s,
            MappedSlice::Write(s) => s,
        }
    }
}

impl core::ops::DerefMut for MappedSlice<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            MappedSlice::Read(_) => panic!("cannot mutably deref a read-only mapping"),
            MappedSlice::Write(s) => s,
        }
    }
}

pub type PoolResult<T> = ZramResult<T>;
