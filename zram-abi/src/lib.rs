//! Shared types, constants and error taxonomy for the compressed RAM block
//! device.
//!
//! This crate has no behavior of its own — it exists so that
//! `zram-pool`, `zram-compress`, `zram-dedup` and `zram-device` can agree on
//! page geometry and error variants without depending on each other.

/// Host page size in bytes. The device's physical block size and the unit
/// of compression are both fixed to this value.
pub const PAGE_SIZE: usize = 4096;

/// Default logical block size advertised to callers of the block device
/// contract.
pub const DEFAULT_LOGICAL_BLOCK_SIZE: usize = 4096;

/// Default "low compression ratio" threshold, as a savings percentage.
///
/// A page whose compressed size saves *less* than this percentage of
/// `PAGE_SIZE` is tagged `COMPRESS_LOW` and becomes writeback-eligible.
/// Preserved verbatim from the source driver's `low_compress_ratio = 75`
/// default; the comparison is `(PAGE_SIZE - comp_len) * 100 / PAGE_SIZE <
/// threshold`, i.e. "below 75% savings", not "compression ratio below 75%".
pub const DEFAULT_LOW_COMPRESS_RATIO: u32 = 75;

/// Default cap on the number of pages written per writeback batch
/// submission.
pub const MAX_WRITEBACK_SIZE: usize = 32;

/// Index of a logical page / slot within a device. Bounded by the device's
/// `disksize / PAGE_SIZE`.
pub type SlotIndex = u32;

/// Index of a block on the backing device. Block 0 is reserved so that 0
/// doubles as "no block".
pub type BackingBlock = u32;

/// Error taxonomy surfaced to callers, mirroring verbatim.
#[derive(Debug, thiserror::Error)]
pub enum ZramError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory: pool exhausted after blocking retry (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("out of space: {0}")]
    OutOfSpace(&'static str),

    #[error("no backing device configured")]
    NoDevice,

    #[error("device busy: {0}")]
    Busy(&'static str),

    #[error("I/O error on slot {slot}: {reason}")]
    Io { slot: SlotIndex, reason: &'static str },

    #[error("interrupted")]
    Interrupted,
}

impl ZramError {
    /// True for the handful of variants write-path callers are expected to
    /// retry on (a blocking allocation retry already happened inside the
    /// store engine; this is for *callers* deciding whether to resubmit a
    /// whole request).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZramError::Interrupted)
    }
}

pub type ZramResult<T> = Result<T, ZramError>;
