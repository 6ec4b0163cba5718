//! Statistics counters and their plain-text tabular readouts.
//!
//! All counters are relaxed atomics except the two historical maxima,
//! which use a compare-and-swap loop.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct ZramStats {
    pub compr_data_size: AtomicU64,
    pub pages_stored: AtomicU64,
    pub max_used_pages: AtomicI64,
    pub same_pages: AtomicU64,
    pub huge_pages: AtomicU64,
    pub lowratio_pages: AtomicU64,
    pub pages_compacted: AtomicU64,
    pub dedup_dup_size: AtomicU64,
    pub dedup_meta_size: AtomicU64,

    pub num_reads: AtomicU64,
    pub num_writes: AtomicU64,
    pub failed_reads: AtomicU64,
    pub failed_writes: AtomicU64,
    pub invalid_io: AtomicU64,
    pub notify_free: AtomicU64,

    pub bd_count: AtomicU64,
    pub bd_reads: AtomicU64,
    pub bd_writes: AtomicU64,

    pub writestall: AtomicU64,
    /// Freeing a slot that carried no content: `slot_free` called on an
    /// already empty slot.
    pub miss_free: AtomicU64,
    /// A write's publish step observed its own slot already carrying
    /// content from a fresher, concurrent write that published first — the
    /// "last publisher wins" edge case made observable. See DESIGN.md.
    pub write_orphan_pages: AtomicU64,
}

fn bump_max(max: &AtomicI64, candidate: i64) {
    let mut current = max.load(Ordering::Relaxed);
    while candidate > current {
        match max.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

impl ZramStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pages_stored(&self, delta: i64) {
        let updated = if delta >= 0 {
            self.pages_stored.fetch_add(delta as u64, Ordering::Relaxed) + delta as u64
        } else {
            self.pages_stored
                .fetch_sub((-delta) as u64, Ordering::Relaxed)
                - (-delta) as u64
        };
        bump_max(&self.max_used_pages, updated as i64);
    }

    pub fn reset_max_used_pages(&self) {
        self.max_used_pages
            .store(self.pages_stored.load(Ordering::Relaxed) as i64, Ordering::Relaxed);
    }

    pub fn reset_all(&self) {
        self.compr_data_size.store(0, Ordering::Relaxed);
        self.pages_stored.store(0, Ordering::Relaxed);
        self.max_used_pages.store(0, Ordering::Relaxed);
        self.same_pages.store(0, Ordering::Relaxed);
        self.huge_pages.store(0, Ordering::Relaxed);
        self.lowratio_pages.store(0, Ordering::Relaxed);
        self.pages_compacted.store(0, Ordering::Relaxed);
        self.dedup_dup_size.store(0, Ordering::Relaxed);
        self.dedup_meta_size.store(0, Ordering::Relaxed);
        self.num_reads.store(0, Ordering::Relaxed);
        self.num_writes.store(0, Ordering::Relaxed);
        self.failed_reads.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
        self.invalid_io.store(0, Ordering::Relaxed);
        self.notify_free.store(0, Ordering::Relaxed);
        self.bd_count.store(0, Ordering::Relaxed);
        self.bd_reads.store(0, Ordering::Relaxed);
        self.bd_writes.store(0, Ordering::Relaxed);
        self.writestall.store(0, Ordering::Relaxed);
        self.miss_free.store(0, Ordering::Relaxed);
        self.write_orphan_pages.store(0, Ordering::Relaxed);
    }

    /// `mm_stat` tuple, verbatim field order.
    #[allow(clippy::too_many_arguments)]
    pub fn mm_stat_line(&self, mem_used_bytes: u64, limit_bytes: u64) -> String {
        let orig_bytes = self.pages_stored.load(Ordering::Relaxed) * zram_abi::PAGE_SIZE as u64;
        format!(
            "{} {} {} {} {} {} {} {} {} {} {}\n",
            orig_bytes,
            self.compr_data_size.load(Ordering::Relaxed),
            mem_used_bytes,
            limit_bytes,
            self.max_used_pages.load(Ordering::Relaxed).max(0) as u64
                * zram_abi::PAGE_SIZE as u64,
            self.same_pages.load(Ordering::Relaxed),
            self.pages_compacted.load(Ordering::Relaxed),
            self.huge_pages.load(Ordering::Relaxed),
            self.dedup_dup_size.load(Ordering::Relaxed),
            self.dedup_meta_size.load(Ordering::Relaxed),
            self.lowratio_pages.load(Ordering::Relaxed),
        )
    }

    /// io_stat_show tuple: failed_reads, failed_writes,
    /// invalid_io, notify_free.
    pub fn io_stat_line(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.failed_reads.load(Ordering::Relaxed),
            self.failed_writes.load(Ordering::Relaxed),
            self.invalid_io.load(Ordering::Relaxed),
            self.notify_free.load(Ordering::Relaxed),
        )
    }

    /// bd_stat_show tuple, in 4 KiB-equivalent units.
    pub fn bd_stat_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.bd_count.load(Ordering::Relaxed),
            self.bd_reads.load(Ordering::Relaxed),
            self.bd_writes.load(Ordering::Relaxed),
        )
    }

    /// `write_orphan_pages` is appended as its own trailing field so the
    /// first line keeps the upstream `debug_stat` shape.
    pub fn debug_stat_line(&self) -> String {
        format!(
            "version: 1\n{} {} {}\n",
            self.writestall.load(Ordering::Relaxed),
            self.miss_free.load(Ordering::Relaxed),
            self.write_orphan_pages.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_used_pages_tracks_high_water_mark() {
        let stats = ZramStats::new();
        stats.record_pages_stored(10);
        stats.record_pages_stored(-4);
        stats.record_pages_stored(3);
        assert_eq!(stats.max_used_pages.load(Ordering::Relaxed), 10);
        assert_eq!(stats.pages_stored.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn reset_max_used_pages_rebases_to_current() {
        let stats = ZramStats::new();
        stats.record_pages_stored(10);
        stats.record_pages_stored(-6);
        stats.reset_max_used_pages();
        assert_eq!(stats.max_used_pages.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn mm_stat_line_has_eleven_fields() {
        let stats = ZramStats::new();
        let line = stats.mm_stat_line(0, 0);
        assert_eq!(line.trim_end().split(' ').count(), 11);
    }
}
