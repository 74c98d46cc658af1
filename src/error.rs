//! Error types for LZMA compression and decompression.
//!
//! All fallible operations in this crate return [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Errors fall into a few categories:
//!
//! | Category | Variants | Typical cause |
//! |----------|----------|---------------|
//! | Header | [`Header`][Error::Header] | Malformed 13-byte stream header |
//! | Arguments | [`InvalidArgument`][Error::InvalidArgument] | Bad level/dictionary/fast-bytes at encoder construction |
//! | Stream | [`Stream`][Error::Stream] | Corrupt range-coded payload |
//! | I/O | [`Io`][Error::Io] | Source read or sink write failure |
//! | Internal | [`Internal`][Error::Internal] | Invariant violation caught at the API boundary |
//!
//! Header and argument errors are always reported before any output is
//! produced. Stream errors abort decoding immediately; output already
//! flushed to the sink is not retracted.

use std::io;

/// Which I/O operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Reading from the byte source.
    Read,
    /// Writing to the byte sink.
    Write,
}

impl std::fmt::Display for IoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// The error type for LZMA stream operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The 13-byte stream header is malformed (bad properties byte or
    /// out-of-range lc/lp/pb).
    #[error("header error: {0}")]
    Header(String),

    /// An argument passed to the encoder is out of range.
    #[error("invalid argument: {msg} (got {value})")]
    InvalidArgument {
        /// What was out of range.
        msg: &'static str,
        /// The offending value.
        value: i64,
    },

    /// The range-coded payload is corrupt: a decoded distance points outside
    /// the valid dictionary window, or the end marker is unparseable.
    #[error("stream error: {0}")]
    Stream(String),

    /// An I/O error from the byte source or sink, annotated with the
    /// operation and the stream offset at which it occurred.
    #[error("{op} failed at byte offset {offset}: {source}")]
    Io {
        /// Read or write.
        op: IoOp,
        /// Bytes transferred on that side of the codec before the failure.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An internal invariant was violated. This indicates a bug in the
    /// codec, not a problem with the input; it is caught at the public API
    /// boundary so it never escapes as a panic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an I/O error from the source side.
    pub(crate) fn read(offset: u64, source: io::Error) -> Self {
        Self::Io {
            op: IoOp::Read,
            offset,
            source,
        }
    }

    /// Wraps an I/O error from the sink side.
    pub(crate) fn write(offset: u64, source: io::Error) -> Self {
        Self::Io {
            op: IoOp::Write,
            offset,
            source,
        }
    }
}

/// A specialized `Result` type for LZMA operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_header() {
        let err = Error::Header("invalid properties byte: 251".into());
        assert_eq!(err.to_string(), "header error: invalid properties byte: 251");
    }

    #[test]
    fn test_display_io_context() {
        let err = Error::read(42, io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        let msg = err.to_string();
        assert!(msg.contains("read"), "missing op in: {msg}");
        assert!(msg.contains("42"), "missing offset in: {msg}");
    }

    #[test]
    fn test_display_invalid_argument() {
        let err = Error::InvalidArgument {
            msg: "compression level out of range",
            value: 12,
        };
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_io_source_is_preserved() {
        let err = Error::write(0, io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("pipe"));
    }
}
