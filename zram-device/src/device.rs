//! The top-level device object: init lifecycle, stats and the pieces every
//! other module in this crate (`store`, `writeback`, `dispatcher`) operates
//! through.

use std::sync::Arc;

use zram_abi::{BackingBlock, SlotIndex, ZramError, ZramResult};
use zram_compress::{Compressor, DeflateCompressor};
use zram_dedup::DedupIndex;
use zram_pool::{ArenaPool, PoolAllocator};
use zram_sync::{TicketLock, TicketRwLock};

use crate::backing::{BackingBitmap, BackingStore, FileBackingStore};
use crate::config::ZramConfig;
use crate::slot::SlotTable;
use crate::stats::ZramStats;

/// The reference pool's "huge" threshold: pages whose compressed size
/// lands at or above this are stored raw rather than compressed. Chosen to
/// match the value this workspace's `zram-pool` tests already exercise
/// (zsmalloc's real `zs_huge_class_size()` is a derived constant of its
/// size-class table — this is a faithful stand-in, not a copy of the
/// upstream computation, which lives in a slab allocator out of scope
/// here.
pub const DEFAULT_HUGE_CLASS_SIZE: usize = 3584;

/// Everything gated by the device init reader/writer lock: created or torn
/// down only by `set_disksize`/`reset`/backing-device changes, read freely
/// by every in-flight I/O request in between.
pub(crate) struct Inner {
    pub config: ZramConfig,
    pub slots: Option<SlotTable>,
    pub pool: Option<Arc<dyn PoolAllocator>>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub dedup: Option<Arc<DedupIndex>>,
    pub backing: Option<BackingState>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            config: ZramConfig::default(),
            slots: None,
            pool: None,
            compressor: None,
            dedup: None,
            backing: None,
        }
    }
}

impl Inner {
    pub fn ensure_ready(&self) -> ZramResult<()> {
        if self.slots.is_none() {
            return Err(ZramError::InvalidArgument("device has no disksize set"));
        }
        Ok(())
    }

    pub fn slots(&self) -> &SlotTable {
        self.slots.as_ref().expect("ensure_ready checked")
    }

    pub fn pool(&self) -> &dyn PoolAllocator {
        self.pool.as_deref().expect("ensure_ready checked")
    }

    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_deref().expect("ensure_ready checked")
    }
}

pub(crate) struct BackingState {
    pub store: Arc<dyn BackingStore>,
    pub bitmap: BackingBitmap,
}

/// State guarded by the O(1) writeback-limit spin lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct WritebackLimit {
    pub remaining_pages: u64,
    pub enabled: bool,
}

/// Cooperative cancellation token consulted once per writeback scan
/// iteration.
#[derive(Default)]
pub struct CancelToken(std::sync::atomic::AtomicBool);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub struct ZramDevice {
    pub(crate) inner: TicketRwLock<Inner>,
    pub stats: ZramStats,
    pub(crate) wb_limit: TicketLock<WritebackLimit>,
    pub cancel: CancelToken,
}

impl Default for ZramDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ZramDevice {
    pub fn new() -> Self {
        Self {
            inner: TicketRwLock::new(Inner::default()),
            stats: ZramStats::new(),
            wb_limit: TicketLock::new(WritebackLimit::default()),
            cancel: CancelToken::new(),
        }
    }

    /// `comp_algorithm`, pre-init only.
    pub fn set_comp_algorithm(&self, name: &str) -> ZramResult<()> {
        let mut inner = self.inner.write();
        inner.config.set_comp_algorithm(name)
    }

    /// `use_dedup`, pre-init only.
    pub fn set_use_dedup(&self, enabled: bool) -> ZramResult<()> {
        let mut inner = self.inner.write();
        inner.config.set_use_dedup(enabled)
    }

    /// `mem_limit`, in pages; `None` = unlimited. Writable at any
    /// time (not gated by init state, matching upstream `mem_limit_store`).
    pub fn set_mem_limit(&self, pages: Option<usize>) {
        self.inner.write().config.set_mem_limit(pages);
    }

    /// attach a backing device, pre-init only. The reference
    /// `FileBackingStore` needs a page count to size the file up front,
    /// standing in for "queries size" against a real block device.
    pub fn set_backing_dev(&self, path: &std::path::Path, nr_pages: u64) -> ZramResult<()> {
        let mut inner = self.inner.write();
        inner.config.set_backing_dev_path(&path.display().to_string())?;
        let store = FileBackingStore::open(path, nr_pages)?;
        let bitmap = BackingBitmap::new(nr_pages);
        inner.backing = Some(BackingState {
            store: Arc::new(store),
            bitmap,
        });
        Ok(())
    }

    /// "reset_bdev tears down the inverse".
    pub fn reset_backing_dev(&self) -> ZramResult<()> {
        let mut inner = self.inner.write();
        inner.backing = None;
        inner.config.backing_dev = None;
        Ok(())
    }

    /// `disksize`: settable once, creates the slot table, pool and
    /// compressor. After this call the device is "initialised".
    pub fn set_disksize(&self, bytes: u64) -> ZramResult<()> {
        let mut inner = self.inner.write();
        inner.config.set_disksize(bytes)?;

        let compressor: Arc<dyn Compressor> = match inner.config.comp_algorithm.as_str() {
            "deflate" => Arc::new(DeflateCompressor::new()),
            _ => return Err(ZramError::InvalidArgument("unknown compressor algorithm")),
        };
        let pool: Arc<dyn PoolAllocator> = Arc::new(ArenaPool::new(DEFAULT_HUGE_CLASS_SIZE, None));
        let dedup = inner.config.use_dedup.then(|| Arc::new(DedupIndex::new()));

        inner.slots = Some(SlotTable::new(inner.config.slot_count()));
        inner.compressor = Some(compressor);
        inner.pool = Some(pool);
        inner.dedup = dedup;
        tracing::debug!(disksize = bytes, "zram device initialised");
        Ok(())
    }

    /// `reset`: tears the device down to `disksize == 0` and zeroes
    /// all stats (matching zram_reset_device).
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
        self.stats.reset_all();
        *self.wb_limit.lock() = WritebackLimit::default();
        tracing::info!("zram device reset");
    }

    /// `compact`: triggers pool compaction.
    pub fn compact(&self) -> ZramResult<usize> {
        let inner = self.inner.read();
        inner.ensure_ready()?;
        let compacted = inner.pool().compact();
        self.stats
            .pages_compacted
            .fetch_add(compacted as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(compacted)
    }

    /// `mem_used_max` write of `0`: rebases the historical max to
    /// the current usage.
    pub fn reset_mem_used_max(&self) {
        self.stats.reset_max_used_pages();
    }

    pub fn set_writeback_limit(&self, pages: u64) {
        self.wb_limit.lock().remaining_pages = pages;
    }

    pub fn set_writeback_limit_enable(&self, enabled: bool) {
        self.wb_limit.lock().enabled = enabled;
    }

    pub fn writeback_limit(&self) -> WritebackLimit {
        *self.wb_limit.lock()
    }

    pub fn disksize(&self) -> u64 {
        self.inner.read().config.disksize
    }

    pub fn is_initialised(&self) -> bool {
        self.inner.read().config.is_initialised()
    }

    pub fn comp_algorithm(&self) -> String {
        self.inner.read().config.comp_algorithm.clone()
    }

    pub fn mem_used_pages(&self) -> usize {
        let inner = self.inner.read();
        inner.pool.as_ref().map(|p| p.total_pages()).unwrap_or(0)
    }

    pub fn mm_stat(&self) -> String {
        let inner = self.inner.read();
        let mem_used_bytes =
            inner.pool.as_ref().map(|p| p.total_pages()).unwrap_or(0) as u64 * zram_abi::PAGE_SIZE as u64;
        let limit_bytes = inner
            .config
            .mem_limit
            .map(|pages| pages as u64 * zram_abi::PAGE_SIZE as u64)
            .unwrap_or(0);
        self.stats.mm_stat_line(mem_used_bytes, limit_bytes)
    }

    pub fn io_stat(&self) -> String {
        self.stats.io_stat_line()
    }

    pub fn bd_stat(&self) -> String {
        self.stats.bd_stat_line()
    }

    pub fn debug_stat(&self) -> String {
        self.stats.debug_stat_line()
    }

    /// A backing block currently holding `index`'s content, if any —
    /// exposed for tests that need to assert against the bitmap.
    pub fn backing_block_of(&self, index: SlotIndex) -> Option<BackingBlock> {
        let inner = self.inner.read();
        let slot = inner.slots.as_ref()?.lock(index);
        if !slot.test_flag(crate::slot::SlotFlag::Wb) {
            return None;
        }
        match slot.get_element() {
            Some(crate::slot::Element::Backing(b)) => Some(b),
            _ => None,
        }
    }
}
