use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::pool::{with_compress, with_decompress, ThreadLocalPool};
use crate::{Compressor, DecompressError};

/// Reference [`Compressor`] built on raw `flate2` deflate streams (no
/// zlib/gzip framing — the slot table already stores the compressed
/// length, so we don't need a length-prefixed container format).
///
/// Fixed at `Compression::fast()`: real compressor backends (lz4, zstd)
/// are tuned for exactly this trade-off (favor latency over ratio, since
/// this sits on the hot read/write path), and a single fixed level keeps
/// the per-thread stream cache correct — streams are pooled per *thread*,
/// not per `DeflateCompressor` instance, so a configurable level would
/// need to be threaded through every pooled stream's reset.
pub struct DeflateCompressor {
    compress_pool: ThreadLocalPool<Compress>,
    decompress_pool: ThreadLocalPool<Decompress>,
}

impl DeflateCompressor {
    pub fn new() -> Self {
        Self {
            compress_pool: ThreadLocalPool::new(new_compress_stream),
            decompress_pool: ThreadLocalPool::new(new_decompress_stream),
        }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new()
    }
}

fn new_compress_stream() -> Compress {
    Compress::new(Compression::fast(), false)
}

fn new_decompress_stream() -> Decompress {
    Decompress::new(false)
}

impl Compressor for DeflateCompressor {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, src: &[u8], out: &mut [u8]) -> Option<usize> {
        with_compress(&self.compress_pool, |stream| {
            match stream.compress(src, out, FlushCompress::Finish) {
                Ok(Status::StreamEnd) => {
                    let produced = stream.total_out() as usize;
                    (produced > 0 && produced <= out.len()).then_some(produced)
                }
                _ => None,
            }
        })
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), DecompressError> {
        with_decompress(&self.decompress_pool, |stream| {
            match stream.decompress(src, dst, FlushDecompress::Finish) {
                Ok(Status::StreamEnd) => Ok(()),
                other => {
                    tracing::warn!(?other, src_len = src.len(), "deflate decompression failed");
                    Err(DecompressError)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_data() {
        let compressor = DeflateCompressor::default();
        let src = (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut compressed = vec![0u8; 8192];
        let comp_len = compressor.compress(&src, &mut compressed).expect("compress");
        let mut dst = vec![0u8; src.len()];
        compressor
            .decompress(&compressed[..comp_len], &mut dst)
            .expect("decompress");
        assert_eq!(dst, src);
    }

    #[test]
    fn compresses_repetitive_data_well() {
        let compressor = DeflateCompressor::default();
        let src = vec![0x42u8; 4096];
        let mut compressed = vec![0u8; 8192];
        let comp_len = compressor.compress(&src, &mut compressed).expect("compress");
        assert!(comp_len < src.len() / 4);
    }

    #[test]
    fn incompressible_like_data_still_round_trips() {
        let compressor = DeflateCompressor::default();
        let mut src = vec![0u8; 4096];
        for (i, b) in src.iter_mut().enumerate() {
            *b = ((i * 167 + 13) % 256) as u8;
        }
        let mut compressed = vec![0u8; 8192];
        let comp_len = compressor.compress(&src, &mut compressed).expect("compress");
        let mut dst = vec![0u8; src.len()];
        compressor
            .decompress(&compressed[..comp_len], &mut dst)
            .expect("decompress");
        assert_eq!(dst, src);
    }

    #[test]
    fn reused_stream_across_calls_does_not_leak_state() {
        let compressor = DeflateCompressor::default();
        let mut out = vec![0u8; 8192];
        for byte in [0u8, 0xffu8, 0x42u8] {
            let src = vec![byte; 4096];
            let comp_len = compressor.compress(&src, &mut out).expect("compress");
            let mut dst = vec![0u8; 4096];
            compressor.decompress(&out[..comp_len], &mut dst).expect("decompress");
            assert_eq!(dst, src);
        }
    }
}
