//! A tiny per-thread free-list, standing in for a "per-CPU stream"
//! in a threaded (not core-pinned) runtime: each OS thread
//! that calls into the compressor keeps its own small cache of `flate2`
//! stream objects instead of allocating fresh ones on every call.

use std::cell::RefCell;

pub struct ThreadLocalPool<T> {
    make: fn() -> T,
}

thread_local! {
    static COMPRESS_CACHE: RefCell<Vec<flate2::Compress>> = const { RefCell::new(Vec::new()) };
    static DECOMPRESS_CACHE: RefCell<Vec<flate2::Decompress>> = const { RefCell::new(Vec::new()) };
}

impl<T> ThreadLocalPool<T> {
    pub const fn new(make: fn() -> T) -> Self {
        Self { make }
    }
}

/// Borrow a compressor stream for the duration of `f`, returning it to the
/// thread-local cache afterwards (even if `f` fails).
pub fn with_compress<R>(pool: &ThreadLocalPool<flate2::Compress>, f: impl FnOnce(&mut flate2::Compress) -> R) -> R {
    let mut stream = COMPRESS_CACHE.with(|c| c.borrow_mut().pop()).unwrap_or_else(pool.make);
    stream.reset();
    let result = f(&mut stream);
    COMPRESS_CACHE.with(|c| c.borrow_mut().push(stream));
    result
}

/// Borrow a decompressor stream for the duration of `f`.
pub fn with_decompress<R>(
    pool: &ThreadLocalPool<flate2::Decompress>,
    f: impl FnOnce(&mut flate2::Decompress) -> R,
) -> R {
    let mut stream = DECOMPRESS_CACHE
        .with(|c| c.borrow_mut().pop())
        .unwrap_or_else(pool.make);
    stream.reset(false);
    let result = f(&mut stream);
    DECOMPRESS_CACHE.with(|c| c.borrow_mut().push(stream));
    result
}
