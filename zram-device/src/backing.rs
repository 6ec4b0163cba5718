//! Backing-device lifecycle, allocation bitmap, and the [`BackingStore`]
//! contract.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use zram_abi::{BackingBlock, ZramError, ZramResult};

/// Contract over a backing block device. The reference implementation
/// (`FileBackingStore`) is a plain file opened read+write; notes
/// that once attached the device "advertises asynchronous I/O semantics" —
/// that's a statement about what a kernel glue layer must not assume about
/// completion ordering, not a requirement that this trait itself be async.
/// A kernel binding can still implement `BackingStore` over real async bio
/// submission; callers here just see a synchronous `Result`.
pub trait BackingStore: Send + Sync {
    fn read_page(&self, block: BackingBlock, dst: &mut [u8]) -> ZramResult<()>;
    fn write_page(&self, block: BackingBlock, src: &[u8]) -> ZramResult<()>;
    /// Write a contiguous run of pages starting at `first_block` in one
    /// submission.
    fn write_pages(&self, first_block: BackingBlock, pages: &[&[u8]]) -> ZramResult<()>;
    fn nr_pages(&self) -> u64;
}

/// One bit per backing block; bit 0 permanently reserved.
pub struct BackingBitmap {
    words: Box<[AtomicU64]>,
    nr_blocks: u64,
}

impl BackingBitmap {
    pub fn new(nr_blocks: u64) -> Self {
        let nr_words = (nr_blocks as usize).div_ceil(64).max(1);
        let words = (0..nr_words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let bitmap = Self { words, nr_blocks };
        // Reserve bit 0 so a zero index can mean "none".
        bitmap.words[0].fetch_or(1, Ordering::Relaxed);
        bitmap
    }

    /// Find a clear bit (skipping bit 0), atomically claim it. Retries on
    /// CAS contention.
    pub fn alloc(&self) -> Option<BackingBlock> {
        for (word_idx, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Relaxed);
                if current == u64::MAX {
                    break;
                }
                let bit = (!current).trailing_zeros();
                let block = word_idx as u64 * 64 + bit as u64;
                if block == 0 || block >= self.nr_blocks {
                    // Either the reserved bit, or past the end of a
                    // partially-used last word.
                    if current | (1 << bit) == u64::MAX {
                        break;
                    }
                    // Mark it permanently used so we don't keep retrying
                    // the same out-of-range bit; then continue scanning.
                    word.fetch_or(1 << bit, Ordering::Relaxed);
                    continue;
                }
                let mask = 1u64 << bit;
                match word.compare_exchange_weak(
                    current,
                    current | mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(block as BackingBlock),
                    Err(_) => continue,
                }
            }
        }
        None
    }

    pub fn free(&self, block: BackingBlock) {
        if block == 0 {
            return;
        }
        let word_idx = (block / 64) as usize;
        let bit = block % 64;
        self.words[word_idx].fetch_and(!(1u64 << bit), Ordering::Relaxed);
    }

    pub fn is_set(&self, block: BackingBlock) -> bool {
        let word_idx = (block / 64) as usize;
        let bit = block % 64;
        self.words[word_idx].load(Ordering::Relaxed) & (1u64 << bit) != 0
    }
}

/// Reference [`BackingStore`]: one page per block, block 0 unused, no
/// on-disk header.
pub struct FileBackingStore {
    file: std::sync::Mutex<File>,
    nr_pages: u64,
}

impl FileBackingStore {
    /// Opens `path` read+write and forces its logical size to
    /// `nr_pages * PAGE_SIZE`.
    pub fn open(path: &Path, nr_pages: u64) -> ZramResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| ZramError::Io {
                slot: 0,
                reason: "failed to open backing device file",
            })?;
        file.set_len(nr_pages * zram_abi::PAGE_SIZE as u64)
            .map_err(|_| ZramError::Io {
                slot: 0,
                reason: "failed to size backing device file",
            })?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
            nr_pages,
        })
    }
}

impl BackingStore for FileBackingStore {
    fn read_page(&self, block: BackingBlock, dst: &mut [u8]) -> ZramResult<()> {
        debug_assert_eq!(dst.len(), zram_abi::PAGE_SIZE);
        let mut file = self.file.lock().unwrap();
        let offset = block as u64 * zram_abi::PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(dst))
            .map_err(|_| ZramError::Io {
                slot: 0,
                reason: "backing device read failed",
            })
    }

    fn write_page(&self, block: BackingBlock, src: &[u8]) -> ZramResult<()> {
        debug_assert_eq!(src.len(), zram_abi::PAGE_SIZE);
        let mut file = self.file.lock().unwrap();
        let offset = block as u64 * zram_abi::PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(src))
            .map_err(|_| ZramError::Io {
                slot: 0,
                reason: "backing device write failed",
            })
    }

    fn write_pages(&self, first_block: BackingBlock, pages: &[&[u8]]) -> ZramResult<()> {
        let mut file = self.file.lock().unwrap();
        let offset = first_block as u64 * zram_abi::PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset)).map_err(|_| ZramError::Io {
            slot: 0,
            reason: "backing device seek failed",
        })?;
        for page in pages {
            file.write_all(page).map_err(|_| ZramError::Io {
                slot: 0,
                reason: "backing device batch write failed",
            })?;
        }
        Ok(())
    }

    fn nr_pages(&self) -> u64 {
        self.nr_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_zero_is_reserved() {
        let bitmap = BackingBitmap::new(16);
        assert!(bitmap.is_set(0));
        let first = bitmap.alloc().unwrap();
        assert_ne!(first, 0);
    }

    #[test]
    fn alloc_free_round_trip() {
        let bitmap = BackingBitmap::new(8);
        let mut allocated = Vec::new();
        for _ in 0..7 {
            allocated.push(bitmap.alloc().unwrap());
        }
        assert!(bitmap.alloc().is_none());
        bitmap.free(allocated[0]);
        assert!(bitmap.alloc().is_some());
    }

    #[test]
    fn file_backing_store_round_trips_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        let store = FileBackingStore::open(&path, 8).unwrap();
        let page = vec![0xAB; zram_abi::PAGE_SIZE];
        store.write_page(3, &page).unwrap();
        let mut out = vec![0u8; zram_abi::PAGE_SIZE];
        store.read_page(3, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn batched_write_covers_contiguous_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.img");
        let store = FileBackingStore::open(&path, 8).unwrap();
        let a = vec![1u8; zram_abi::PAGE_SIZE];
        let b = vec![2u8; zram_abi::PAGE_SIZE];
        store.write_pages(2, &[&a, &b]).unwrap();
        let mut out = vec![0u8; zram_abi::PAGE_SIZE];
        store.read_page(2, &mut out).unwrap();
        assert_eq!(out, a);
        store.read_page(3, &mut out).unwrap();
        assert_eq!(out, b);
    }
}
