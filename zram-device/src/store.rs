//! Store engine: write path, read path, slot free.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use zram_abi::{SlotIndex, ZramError, ZramResult, PAGE_SIZE};
use zram_compress::Compressor;
use zram_dedup::DedupEntry;
use zram_pool::{AllocMode, MapMode, PoolAllocator};

use crate::device::{Inner, ZramDevice};
use crate::slot::{Element, EntryRef, SlotFlag, SlotGuard};

/// See `release_entry`'s doc comment.
const DEDUP_META_OVERHEAD_BYTES: u64 = 48;

/// Returns the repeated word if every machine word (here, `u64`) in the
/// page is identical.
fn detect_same_fill(page: &[u8]) -> Option<u64> {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut chunks = page.chunks_exact(8);
    let first = u64::from_ne_bytes(chunks.next()?.try_into().unwrap());
    for chunk in chunks {
        if u64::from_ne_bytes(chunk.try_into().unwrap()) != first {
            return None;
        }
    }
    Some(first)
}

fn fill_page(dst: &mut [u8], word: u64) {
    let bytes = word.to_ne_bytes();
    for chunk in dst.chunks_exact_mut(8) {
        chunk.copy_from_slice(&bytes);
    }
}

/// Compress, or fall back to huge (raw) storage when the
/// compressed length isn't worth keeping. Returns `(final_len, is_huge)`;
/// `final_len` is already `PAGE_SIZE` in the huge case.
fn compress_or_huge(
    compressor: &dyn Compressor,
    src: &[u8],
    scratch: &mut [u8],
    huge_threshold: usize,
) -> Option<(usize, bool)> {
    let len = compressor.compress(src, scratch)?;
    if len >= huge_threshold {
        Some((PAGE_SIZE, true))
    } else {
        Some((len, false))
    }
}

/// A checksum match is only a candidate until its bytes
/// are confirmed identical.
fn verify_candidate(
    pool: &dyn PoolAllocator,
    compressor: &dyn Compressor,
    candidate: &DedupEntry,
    src: &[u8],
) -> bool {
    let mapped = pool.map(candidate.handle, MapMode::Read);
    let matches = if candidate.comp_len as usize == PAGE_SIZE {
        &mapped[..PAGE_SIZE] == src
    } else {
        let mut scratch = vec![0u8; PAGE_SIZE];
        compressor
            .decompress(&mapped[..candidate.comp_len as usize], &mut scratch)
            .map(|_| scratch == src)
            .unwrap_or(false)
    };
    pool.unmap(candidate.handle);
    matches
}

impl ZramDevice {
    pub fn write(&self, index: SlotIndex, src: &[u8]) -> ZramResult<()> {
        let _span = tracing::debug_span!("write", index).entered();
        let inner = self.inner.read();
        inner.ensure_ready()?;
        self.write_slot(&inner, index, src)
    }

    pub(crate) fn write_slot(&self, inner: &Inner, index: SlotIndex, src: &[u8]) -> ZramResult<()> {
        debug_assert_eq!(src.len(), PAGE_SIZE);
        let slots = inner.slots();
        let pool = inner.pool();
        let compressor = inner.compressor();

        if let Some(word) = detect_same_fill(src) {
            let slot = slots.lock(index);
            let was_allocated = slot.is_allocated();
            self.free_slot(inner, &slot);
            slot.set_flag(SlotFlag::Same);
            slot.set_element(Element::SameFill(word));
            self.stats.same_pages.fetch_add(1, Ordering::Relaxed);
            self.stats.record_pages_stored(1);
            if was_allocated {
                self.stats.write_orphan_pages.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        let checksum = inner.dedup.is_some().then(|| zram_dedup::checksum(src));
        let mut dedup_hit: Option<(u32, Arc<DedupEntry>)> = None;

        if let (Some(sum), Some(dedup)) = (checksum, inner.dedup.as_ref()) {
            for candidate in dedup.candidates(sum) {
                if verify_candidate(pool, compressor, &candidate, src) {
                    dedup.acquire(&candidate);
                    dedup_hit = Some((sum, candidate));
                    break;
                }
            }
        }

        let (handle, final_len, is_huge, dedup_info) = if let Some((sum, candidate)) = dedup_hit {
            let is_huge = candidate.comp_len as usize == PAGE_SIZE;
            let len = candidate.comp_len;
            let handle = candidate.handle;
            self.stats
                .dedup_dup_size
                .fetch_add(len as u64, Ordering::Relaxed);
            (handle, len, is_huge, Some((sum, candidate)))
        } else {
            let huge_threshold = pool.huge_class_size();
            let mut scratch = vec![0u8; PAGE_SIZE * 2];
            let (mut len, mut is_huge) = compress_or_huge(compressor, src, &mut scratch, huge_threshold)
                .ok_or(ZramError::Io {
                    slot: index,
                    reason: "compression failed",
                })?;

            let mut handle = pool.alloc(len, AllocMode::NonBlocking);
            if handle.is_none() {
                self.stats.writestall.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index, "non-blocking allocation failed, retrying blocking");
                // Redo compression because the per-CPU stream may have
                // changed by the time the blocking allocation runs.
                let (len2, huge2) = compress_or_huge(compressor, src, &mut scratch, huge_threshold)
                    .ok_or(ZramError::Io {
                        slot: index,
                        reason: "compression failed",
                    })?;
                len = len2;
                is_huge = huge2;
                handle = pool.alloc(len, AllocMode::Blocking);
            }
            let handle = handle.ok_or(ZramError::OutOfMemory { requested: len })?;

            if let Some(limit) = inner.config.mem_limit {
                if pool.total_pages() > limit {
                    pool.free(handle);
                    return Err(ZramError::OutOfMemory { requested: len });
                }
            }

            {
                let mut mapped = pool.map(handle, MapMode::Write);
                if is_huge {
                    mapped[..PAGE_SIZE].copy_from_slice(src);
                } else {
                    mapped[..len].copy_from_slice(&scratch[..len]);
                }
            }
            pool.unmap(handle);

            let dedup_info = if let (Some(sum), Some(dedup)) = (checksum, inner.dedup.as_ref()) {
                self.stats
                    .dedup_meta_size
                    .fetch_add(DEDUP_META_OVERHEAD_BYTES, Ordering::Relaxed);
                Some((sum, dedup.insert(sum, handle, len as u32)))
            } else {
                None
            };

            (handle, len as u32, is_huge, dedup_info)
        };

        // Step 7: publish under the slot lock.
        let slot = slots.lock(index);
        let was_allocated = slot.is_allocated();
        self.free_slot(inner, &slot);
        slot.set_entry(EntryRef {
            handle,
            dedup: dedup_info,
        });
        slot.set_size(final_len);
        if is_huge {
            slot.set_flag(SlotFlag::Huge);
            self.stats.huge_pages.fetch_add(1, Ordering::Relaxed);
        }
        let savings = ((PAGE_SIZE as u32 - final_len) * 100) / PAGE_SIZE as u32;
        if savings < inner.config.low_compress_ratio {
            slot.set_flag(SlotFlag::CompressLow);
            self.stats.lowratio_pages.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .compr_data_size
            .fetch_add(final_len as u64, Ordering::Relaxed);
        self.stats.record_pages_stored(1);
        if was_allocated {
            self.stats.write_orphan_pages.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read(&self, index: SlotIndex, dst: &mut [u8], track_access: bool) -> ZramResult<()> {
        let _span = tracing::debug_span!("read", index).entered();
        let inner = self.inner.read();
        inner.ensure_ready()?;
        self.read_slot(&inner, index, dst, track_access)
    }

    pub(crate) fn read_slot(
        &self,
        inner: &Inner,
        index: SlotIndex,
        dst: &mut [u8],
        track_access: bool,
    ) -> ZramResult<()> {
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        let slots = inner.slots();
        let slot = slots.lock(index);

        if slot.test_flag(SlotFlag::Wb) {
            let block = match slot.get_element() {
                Some(Element::Backing(b)) => b,
                _ => {
                    return Err(ZramError::Io {
                        slot: index,
                        reason: "WB slot missing backing block index",
                    })
                }
            };
            drop(slot);
            let backing = inner.backing.as_ref().ok_or(ZramError::NoDevice)?;
            backing.store.read_page(block, dst)?;
            self.stats.bd_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if slot.test_flag(SlotFlag::Same) || !slot.is_allocated() {
            let word = match slot.get_element() {
                Some(Element::SameFill(w)) => w,
                _ => 0,
            };
            fill_page(dst, word);
        } else {
            let entry = slot.get_entry().ok_or(ZramError::Io {
                slot: index,
                reason: "allocated slot missing entry",
            })?;
            let pool = inner.pool();
            let mapped = pool.map(entry.handle, MapMode::Read);
            let size = slot.get_size() as usize;
            if size == PAGE_SIZE {
                dst.copy_from_slice(&mapped[..PAGE_SIZE]);
            } else {
                let compressor = inner.compressor();
                compressor
                    .decompress(&mapped[..size], dst)
                    .map_err(|_| ZramError::Io {
                        slot: index,
                        reason: "decompression failed",
                    })?;
            }
            drop(mapped);
            pool.unmap(entry.handle);
        }

        if track_access {
            slot.clear_flag(SlotFlag::Idle);
            slot.idle_count_clear();
        }
        Ok(())
    }

    /// Must be called with the slot lock held. Frees whatever
    /// the slot currently holds and leaves it empty; callers re-publish
    /// new content afterwards under the same critical section.
    pub(crate) fn free_slot(&self, inner: &Inner, slot: &SlotGuard<'_>) {
        if !slot.is_allocated() {
            self.stats.miss_free.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if slot.test_flag(SlotFlag::Idle) {
            slot.clear_flag(SlotFlag::Idle);
        }
        slot.idle_count_clear();

        if slot.test_flag(SlotFlag::CompressLow) {
            slot.clear_flag(SlotFlag::CompressLow);
            self.stats.lowratio_pages.fetch_sub(1, Ordering::Relaxed);
        }
        if slot.test_flag(SlotFlag::Huge) {
            slot.clear_flag(SlotFlag::Huge);
            self.stats.huge_pages.fetch_sub(1, Ordering::Relaxed);
        }

        if slot.test_flag(SlotFlag::Wb) {
            slot.clear_flag(SlotFlag::Wb);
            if let (Some(backing), Some(Element::Backing(block))) =
                (&inner.backing, slot.get_element())
            {
                backing.bitmap.free(block);
            }
        } else if slot.test_flag(SlotFlag::Same) {
            slot.clear_flag(SlotFlag::Same);
            self.stats.same_pages.fetch_sub(1, Ordering::Relaxed);
        } else if let Some(entry) = slot.get_entry() {
            let size = slot.get_size();
            self.release_entry(inner, &entry, size);
            self.stats
                .compr_data_size
                .fetch_sub(size as u64, Ordering::Relaxed);
        }

        slot.set_size(0);
        slot.clear_payload();
        self.stats.record_pages_stored(-1);
    }

    /// Approximate per-entry bookkeeping overhead a dedup hit avoids
    /// re-paying; kept as a documented estimate rather than a precise port
    /// (see DESIGN.md).
    fn release_entry(&self, inner: &Inner, entry: &EntryRef, size: u32) {
        match (&entry.dedup, &inner.dedup) {
            (Some((checksum, dedup_entry)), Some(dedup)) => match dedup.release(*checksum, dedup_entry) {
                Some(handle) => {
                    inner.pool().free(handle);
                    self.stats
                        .dedup_meta_size
                        .fetch_sub(DEDUP_META_OVERHEAD_BYTES, Ordering::Relaxed);
                }
                None => {
                    self.stats
                        .dedup_dup_size
                        .fetch_sub(size as u64, Ordering::Relaxed);
                }
            },
            _ => inner.pool().free(entry.handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ZramDevice;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    fn incompressible_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE)
            .map(|i| ((i as u32).wrapping_mul(2654435761).wrapping_add(seed as u32) % 256) as u8)
            .collect()
    }

    fn fresh_device(pages: u64) -> ZramDevice {
        let device = ZramDevice::new();
        device.set_disksize(pages * PAGE_SIZE as u64).unwrap();
        device
    }

    #[test]
    fn same_fill_page_round_trips_with_zero_bytes_stored() {
        let device = fresh_device(4);
        device.write(0, &page_of(0)).unwrap();
        assert_eq!(device.stats.same_pages.load(Ordering::Relaxed), 1);
        assert_eq!(device.stats.compr_data_size.load(Ordering::Relaxed), 0);

        let mut out = vec![0xffu8; PAGE_SIZE];
        device.read(0, &mut out, true).unwrap();
        assert_eq!(out, page_of(0));
    }

    #[test]
    fn distinct_random_pages_round_trip() {
        let device = fresh_device(8);
        let pages: Vec<Vec<u8>> = (0..8).map(|i| incompressible_page(i as u8 * 37 + 11)).collect();
        for (i, page) in pages.iter().enumerate() {
            device.write(i as u32, page).unwrap();
        }
        for (i, page) in pages.iter().enumerate() {
            let mut out = vec![0u8; PAGE_SIZE];
            device.read(i as u32, &mut out, true).unwrap();
            assert_eq!(&out, page);
        }
        assert_eq!(device.stats.pages_stored.load(Ordering::Relaxed), 8);
        assert_eq!(device.stats.same_pages.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn overwrite_frees_previous_content() {
        let device = fresh_device(2);
        device.write(0, &incompressible_page(5)).unwrap();
        assert_eq!(device.stats.pages_stored.load(Ordering::Relaxed), 1);
        device.write(0, &page_of(0xAB)).unwrap();
        assert_eq!(device.stats.pages_stored.load(Ordering::Relaxed), 1);
        assert_eq!(device.stats.same_pages.load(Ordering::Relaxed), 1);
        assert_eq!(
            device.stats.write_orphan_pages.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn dedup_reuses_entry_for_identical_pages() {
        let device = ZramDevice::new();
        device.set_use_dedup(true).unwrap();
        device.set_disksize(4 * PAGE_SIZE as u64).unwrap();
        let page = incompressible_page(99);
        device.write(0, &page).unwrap();
        device.write(1, &page).unwrap();
        assert_eq!(device.stats.pages_stored.load(Ordering::Relaxed), 2);

        let mut out = vec![0u8; PAGE_SIZE];
        device.read(1, &mut out, true).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn free_slot_leaves_empty_slot_reported_as_miss() {
        let device = fresh_device(1);
        let inner = device.inner.read();
        let slot = inner.slots().lock(0);
        device.free_slot(&inner, &slot);
        assert_eq!(device.stats.miss_free.load(Ordering::Relaxed), 1);
    }
}
