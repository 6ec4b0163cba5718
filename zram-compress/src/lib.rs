//! Compressor adapter — a contract over a per-CPU compression
//! stream, plus [`DeflateCompressor`], a reference backend built on
//! `flate2` (this repo's lineage treats the actual compressor backend
//! registry as an external collaborator; here we just need one real,
//! working backend to drive the store engine).

mod deflate;
mod pool;

pub use deflate::DeflateCompressor;

/// Contract over a per-CPU compression stream.
///
/// Implementations obtain a stream internally (e.g. from a thread-local
/// free-list) for the duration of each call — there is no explicit
/// acquire/release in this trait because Rust's borrow checker already
/// prevents a caller from holding one compressor call open across another.
pub trait Compressor: Send + Sync {
    /// Stable name advertised through the `comp_algorithm` control
    /// attribute.
    fn name(&self) -> &'static str;

    /// Compress `src` into `out`. Returns the number of bytes written, or
    /// `None` on the rare case compression itself fails. `out` must be at
    /// least `zram_abi::PAGE_SIZE` bytes — a pathological expansion is
    /// still bounded by the huge-page fallback one layer up.
    fn compress(&self, src: &[u8], out: &mut [u8]) -> Option<usize>;

    /// Decompress `src` (exactly `comp_len` meaningful bytes) into `dst`.
    /// A decompression failure is fatal for the read that triggered it,
    /// never for the device.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), DecompressError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("decompression failed")]
pub struct DecompressError;
