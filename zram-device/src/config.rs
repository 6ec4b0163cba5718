//! Control surface configuration.
//!
//! Mirrors the control attribute table verbatim: most fields may only be
//! set before the device is initialised (`disksize == 0`), enforced here
//! rather than at the call site so every caller gets the same `Busy` error.

use zram_abi::{ZramError, ZramResult};

/// Plain struct mirroring the control attributes. Held inside
/// the device's init reader/writer lock so a writer
/// sees no concurrent readers while changing pre-init fields.
#[derive(Debug, Clone)]
pub struct ZramConfig {
    pub disksize: u64,
    pub logical_block_size: usize,
    pub comp_algorithm: String,
    pub mem_limit: Option<usize>,
    pub backing_dev: Option<String>,
    pub use_dedup: bool,
    pub low_compress_ratio: u32,
}

impl Default for ZramConfig {
    fn default() -> Self {
        Self {
            disksize: 0,
            logical_block_size: zram_abi::DEFAULT_LOGICAL_BLOCK_SIZE,
            comp_algorithm: "deflate".to_string(),
            mem_limit: None,
            backing_dev: None,
            use_dedup: false,
            low_compress_ratio: zram_abi::DEFAULT_LOW_COMPRESS_RATIO,
        }
    }
}

impl ZramConfig {
    pub fn is_initialised(&self) -> bool {
        self.disksize != 0
    }

    /// `disksize` settable once before use, bytes, page-aligned.
    pub fn set_disksize(&mut self, bytes: u64) -> ZramResult<()> {
        if self.is_initialised() {
            return Err(ZramError::Busy("disksize already set"));
        }
        if bytes == 0 || bytes as usize % zram_abi::PAGE_SIZE != 0 {
            return Err(ZramError::InvalidArgument(
                "disksize must be a positive multiple of PAGE_SIZE",
            ));
        }
        self.disksize = bytes;
        Ok(())
    }

    /// `comp_algorithm` settable only before init.
    pub fn set_comp_algorithm(&mut self, name: &str) -> ZramResult<()> {
        if self.is_initialised() {
            return Err(ZramError::Busy("cannot change compressor after init"));
        }
        self.comp_algorithm = name.to_string();
        Ok(())
    }

    /// `backing_dev` path settable only before init.
    pub fn set_backing_dev_path(&mut self, path: &str) -> ZramResult<()> {
        if self.is_initialised() {
            return Err(ZramError::Busy("cannot change backing device after init"));
        }
        self.backing_dev = Some(path.to_string());
        Ok(())
    }

    /// `use_dedup` on/off, pre-init only.
    pub fn set_use_dedup(&mut self, enabled: bool) -> ZramResult<()> {
        if self.is_initialised() {
            return Err(ZramError::Busy("cannot change dedup mode after init"));
        }
        self.use_dedup = enabled;
        Ok(())
    }

    /// `mem_limit`, 0 = unlimited. Writable at any time.
    ///
    /// `Some(0)` is folded into `None` here so every caller, including ones
    /// that pass the control attribute's raw page count straight through,
    /// gets the "0 = unlimited" convention without having to know about it.
    pub fn set_mem_limit(&mut self, pages: Option<usize>) {
        self.mem_limit = match pages {
            Some(0) => None,
            other => other,
        };
    }

    pub fn slot_count(&self) -> usize {
        (self.disksize as usize) / zram_abi::PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disksize_rejects_unaligned_and_repeat_sets() {
        let mut cfg = ZramConfig::default();
        assert!(cfg.set_disksize(100).is_err());
        cfg.set_disksize(4096 * 4).unwrap();
        assert!(matches!(
            cfg.set_disksize(4096 * 8),
            Err(ZramError::Busy(_))
        ));
    }

    #[test]
    fn comp_algorithm_locked_after_init() {
        let mut cfg = ZramConfig::default();
        cfg.set_comp_algorithm("lz4").unwrap();
        cfg.set_disksize(4096).unwrap();
        assert!(matches!(
            cfg.set_comp_algorithm("zstd"),
            Err(ZramError::Busy(_))
        ));
    }

    #[test]
    fn mem_limit_zero_means_unlimited() {
        let mut cfg = ZramConfig::default();
        cfg.set_mem_limit(Some(500));
        assert_eq!(cfg.mem_limit, Some(500));
        cfg.set_mem_limit(Some(0));
        assert_eq!(cfg.mem_limit, None);
    }
}
