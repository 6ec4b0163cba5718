//! The compressed RAM-backed block device: slot table, store/read/free
//! engine, writeback, request dispatch and the multi-device registry.

mod backing;
mod config;
mod device;
mod dispatcher;
mod registry;
mod slot;
mod stats;
mod store;
mod writeback;

pub use backing::{BackingBitmap, BackingStore, FileBackingStore};
pub use config::ZramConfig;
pub use device::{CancelToken, WritebackLimit, ZramDevice, DEFAULT_HUGE_CLASS_SIZE};
pub use dispatcher::IoOp;
pub use registry::ZramRegistry;
pub use slot::{Element, EntryRef, SlotFlag, SlotTable};
pub use stats::ZramStats;
pub use writeback::WritebackMode;

pub use zram_abi::{
    BackingBlock, SlotIndex, ZramError, ZramResult, DEFAULT_LOGICAL_BLOCK_SIZE,
    DEFAULT_LOW_COMPRESS_RATIO, MAX_WRITEBACK_SIZE, PAGE_SIZE,
};

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn incompressible_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE)
            .map(|i| ((i as u32).wrapping_mul(2654435761).wrapping_add(seed as u32) % 256) as u8)
            .collect()
    }

    /// Exercises the full stack a real caller would: registry → device →
    /// dispatcher → store/writeback → backing device, including a page
    /// surviving a round trip through the backing device.
    #[test]
    fn end_to_end_write_writeback_read_reset() {
        let registry = ZramRegistry::new();
        let (_id, device) = registry.add();

        let dir = tempfile::tempdir().unwrap();
        device
            .set_backing_dev(&dir.path().join("backing.img"), 16)
            .unwrap();
        device.set_disksize(4 * PAGE_SIZE as u64).unwrap();

        let page = incompressible_page(42);
        let mut buf = page.clone();
        device.dispatch(IoOp::Write, 0, PAGE_SIZE as u64, &mut buf).unwrap();

        let published = device.writeback(WritebackMode::Huge).unwrap();
        assert_eq!(published, 1);
        assert!(device.backing_block_of(0).is_some());

        let mut out = vec![0u8; PAGE_SIZE];
        device.dispatch(IoOp::Read, 0, PAGE_SIZE as u64, &mut out).unwrap();
        assert_eq!(out, page);

        device.reset();
        assert!(!device.is_initialised());
        assert_eq!(device.mm_stat().split(' ').next().unwrap(), "0");
    }

    #[test]
    fn registry_reset_all_tears_down_every_device() {
        let registry = ZramRegistry::new();
        let (_id0, dev0) = registry.add();
        let (_id1, dev1) = registry.add();
        dev0.set_disksize(PAGE_SIZE as u64).unwrap();
        dev1.set_disksize(PAGE_SIZE as u64).unwrap();

        registry.reset_all();
        assert!(!dev0.is_initialised());
        assert!(!dev1.is_initialised());
    }

    #[test]
    fn writeback_limit_blocks_further_eviction() {
        let device = ZramDevice::new();
        device.set_disksize(2 * PAGE_SIZE as u64).unwrap();
        let dir = tempfile::tempdir().unwrap();
        device
            .set_backing_dev(&dir.path().join("backing.img"), 8)
            .unwrap();

        for i in 0..2u32 {
            let mut buf = incompressible_page(i as u8 + 1);
            device
                .dispatch(IoOp::Write, i as u64 * PAGE_SIZE as u64, PAGE_SIZE as u64, &mut buf)
                .unwrap();
        }
        device.set_writeback_limit(1);
        device.set_writeback_limit_enable(true);

        let published = device.writeback(WritebackMode::Huge).unwrap();
        assert_eq!(published, 1);
        assert_eq!(device.writeback_limit().remaining_pages, 0);

        let err = device.writeback(WritebackMode::Huge).unwrap_err();
        assert!(matches!(err, ZramError::OutOfSpace(_)));
    }
}
