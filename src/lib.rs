//! # elzma
//!
//! A pure-Rust LZMA stream codec: adaptive binary range coding over an
//! LZ77 match model, with a price-driven optimal parser on the encoder
//! side.
//!
//! Streams use the classic 13-byte header (packed lc/lp/pb properties,
//! dictionary size, uncompressed size) followed by the range-coded
//! payload. Streams of unknown size are terminated with an explicit end
//! marker.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::io::Cursor;
//! use elzma::{compress_level, decompress, Result};
//!
//! fn main() -> Result<()> {
//!     let data = b"an example of some compressible example data";
//!
//!     let mut compressed = Vec::new();
//!     compress_level(Cursor::new(&data[..]), &mut compressed, data.len() as i64, 6)?;
//!
//!     let mut restored = Vec::new();
//!     decompress(Cursor::new(&compressed[..]), &mut restored)?;
//!     assert_eq!(restored, data);
//!     Ok(())
//! }
//! ```
//!
//! Pass `-1` as the size when it is not known up front; the encoder then
//! appends an end marker (5 or 6 extra bytes) instead of relying on the
//! header.
//!
//! ## Tuning
//!
//! [`EncoderOptions::from_level`] maps levels 1..=9 to dictionary size and
//! match-depth presets; individual fields (dictionary size, fast bytes,
//! lc/lp/pb, match finder) can be overridden before building an
//! [`Encoder`].
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Malformed headers, corrupt payloads,
//! out-of-range options, and source/sink I/O failures each map to their own
//! [`Error`] variant; internal invariant violations are caught at this
//! API boundary and surface as [`Error::Internal`] instead of panics.
//!
//! ## Minimum Supported Rust Version (MSRV)
//!
//! This crate requires **Rust 1.85** or later.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub mod constants;
pub mod error;
pub mod header;

mod decoder;
mod encoder;
mod lencoder;
mod litcoder;
mod matchfind;
mod rangecoder;
mod state;
mod window;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Error, IoOp, Result};
pub use header::{EncoderOptions, MatchFinder, Properties};

/// The default compression level.
pub const DEFAULT_LEVEL: u32 = 5;

fn guard<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Internal(msg))
        }
    }
}

/// Compresses `source` into `sink` with explicit options.
///
/// `size` is the exact number of bytes `source` will yield, or `-1` if
/// unknown. Returns the compressed size, header included.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for out-of-range options or size, and
/// [`Error::Io`] for source/sink failures.
pub fn compress_with<R: Read, W: Write>(
    source: R,
    sink: W,
    size: i64,
    opts: EncoderOptions,
) -> Result<u64> {
    guard(move || Encoder::new(source, sink, size, opts)?.run())
}

/// Compresses `source` into `sink` at the given level (1..=9).
///
/// See [`compress_with`] for the `size` contract and errors.
pub fn compress_level<R: Read, W: Write>(
    source: R,
    sink: W,
    size: i64,
    level: u32,
) -> Result<u64> {
    compress_with(source, sink, size, EncoderOptions::from_level(level)?)
}

/// Compresses `source` into `sink` at [`DEFAULT_LEVEL`].
pub fn compress<R: Read, W: Write>(source: R, sink: W, size: i64) -> Result<u64> {
    compress_level(source, sink, size, DEFAULT_LEVEL)
}

/// Decompresses a stream from `source` into `sink`.
///
/// Returns the number of uncompressed bytes written. Bytes already flushed
/// to `sink` before an error are not retracted.
///
/// # Errors
///
/// Returns [`Error::Header`] for a malformed header, [`Error::Stream`] for
/// a corrupt payload, and [`Error::Io`] for source/sink failures.
pub fn decompress<R: Read, W: Write>(source: R, sink: W) -> Result<u64> {
    guard(move || Decoder::new(source, sink)?.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_guard_converts_panics() {
        let err = guard::<()>(|| panic!("boom")).unwrap_err();
        match err {
            Error::Internal(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_compress_decompress_roundtrip() {
        let data = b"top-level API roundtrip, top-level API roundtrip";
        let mut compressed = Vec::new();
        compress(Cursor::new(&data[..]), &mut compressed, data.len() as i64).unwrap();
        let mut restored = Vec::new();
        let n = decompress(Cursor::new(&compressed[..]), &mut restored).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(restored, data);
    }

    #[test]
    fn test_compress_level_out_of_range() {
        let err = compress_level(Cursor::new(&b"x"[..]), Vec::new(), 1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
