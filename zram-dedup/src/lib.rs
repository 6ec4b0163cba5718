//! Content-hash dedup index.
//!
//! Grounded on this retrieval pack's `harborgrid-justin-rusty-db` stack,
//! which reaches for `crc32fast` and `dashmap` for exactly this shape of
//! problem (a concurrently-accessed checksum → entry table); the reference
//! driver crate has no dedup-like subsystem of its own to generalize.
//!
//! A checksum match is only a *candidate* — it still requires
//! byte-identical content, so checksum collisions must be resolved by
//! the caller (the store engine, which already has the original page and
//! a compressor to decompress a candidate for comparison). This index
//! only tracks checksum → candidate entries and their refcounts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use zram_pool::PoolHandle;

/// Checksum of a full page's plaintext bytes.
pub fn checksum(page: &[u8]) -> u32 {
    crc32fast::hash(page)
}

/// A pool entry shared by one or more slots via dedup.
pub struct DedupEntry {
    pub handle: PoolHandle,
    pub comp_len: u32,
    refcount: AtomicU32,
}

impl DedupEntry {
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct DedupIndex {
    buckets: DashMap<u32, Vec<Arc<DedupEntry>>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate entries sharing `checksum`. The caller must still verify
    /// byte-identical content (by decompressing and comparing) before
    /// treating any of these as a real hit.
    pub fn candidates(&self, checksum: u32) -> Vec<Arc<DedupEntry>> {
        self.buckets
            .get(&checksum)
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    /// Record a fresh entry (refcount starts at 1, the slot that just
    /// published it).
    pub fn insert(&self, checksum: u32, handle: PoolHandle, comp_len: u32) -> Arc<DedupEntry> {
        let entry = Arc::new(DedupEntry {
            handle,
            comp_len,
            refcount: AtomicU32::new(1),
        });
        self.buckets
            .entry(checksum)
            .or_default()
            .push(Arc::clone(&entry));
        entry
    }

    /// A second slot is reusing `entry` via dedup; bump its refcount.
    pub fn acquire(&self, entry: &Arc<DedupEntry>) -> u32 {
        entry.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A slot holding `entry` was freed. Returns the pool handle to free
    /// if this was the last reference, `None` if other slots still share
    /// the entry.
    pub fn release(&self, checksum: u32, entry: &Arc<DedupEntry>) -> Option<PoolHandle> {
        let remaining = entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return None;
        }
        if let Some(mut bucket) = self.buckets.get_mut(&checksum) {
            bucket.retain(|e| !Arc::ptr_eq(e, entry));
            if bucket.is_empty() {
                drop(bucket);
                self.buckets.remove(&checksum);
            }
        }
        Some(entry.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zram_pool::PoolHandle;

    fn handle(index: u32) -> PoolHandle {
        PoolHandle::from_raw(0, index)
    }

    #[test]
    fn checksum_is_stable_for_identical_content() {
        let a = vec![7u8; 4096];
        let b = vec![7u8; 4096];
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn refcount_tracks_shared_entries() {
        let index = DedupIndex::new();
        let entry = index.insert(42, handle(1), 100);
        assert_eq!(entry.refcount(), 1);

        let candidates = index.candidates(42);
        assert_eq!(candidates.len(), 1);
        index.acquire(&candidates[0]);
        assert_eq!(entry.refcount(), 2);

        assert!(index.release(42, &entry).is_none());
        assert_eq!(index.release(42, &entry), Some(entry.handle));
        assert!(index.candidates(42).is_empty());
    }
}
