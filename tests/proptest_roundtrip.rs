//! Property-based tests using proptest.
//!
//! Every compressed stream must decode back to its exact input, for any
//! byte content, at known and unknown declared sizes. Levels stay low to
//! keep dictionaries small under the proptest case count.

use proptest::prelude::*;
use std::io::Cursor;

use elzma::{compress_level, decompress};

fn roundtrip(data: &[u8], size: i64, level: u32) -> Vec<u8> {
    let mut compressed = Vec::new();
    compress_level(Cursor::new(data), &mut compressed, size, level)
        .unwrap_or_else(|e| panic!("compress failed: {e}"));
    let mut restored = Vec::new();
    decompress(Cursor::new(&compressed[..]), &mut restored)
        .unwrap_or_else(|e| panic!("decompress failed: {e}"));
    restored
}

proptest! {
    /// Arbitrary bytes survive a known-size roundtrip.
    #[test]
    fn arbitrary_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(roundtrip(&data, data.len() as i64, 1), data);
    }

    /// Arbitrary bytes survive an unknown-size roundtrip, where the stream
    /// relies on the end marker rather than the header.
    #[test]
    fn unknown_size_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        prop_assert_eq!(roundtrip(&data, -1, 2), data);
    }

    /// Repetitive input exercises the rep-distance paths and never loses
    /// bytes.
    #[test]
    fn repeated_pattern_roundtrip(
        pattern in proptest::collection::vec(any::<u8>(), 1..16),
        reps in 1usize..400,
    ) {
        let data: Vec<u8> = pattern.iter().cycle().take(pattern.len() * reps).copied().collect();
        prop_assert_eq!(roundtrip(&data, data.len() as i64, 3), data);
    }

    /// Low-entropy input drawn from a small alphabet roundtrips and
    /// compresses at least somewhat.
    #[test]
    fn small_alphabet_compresses(data in proptest::collection::vec(0u8..4, 512..2048)) {
        let mut compressed = Vec::new();
        compress_level(Cursor::new(&data[..]), &mut compressed, data.len() as i64, 2)
            .unwrap_or_else(|e| panic!("compress failed: {e}"));
        prop_assert!(compressed.len() < data.len());
        let mut restored = Vec::new();
        decompress(Cursor::new(&compressed[..]), &mut restored)
            .unwrap_or_else(|e| panic!("decompress failed: {e}"));
        prop_assert_eq!(restored, data);
    }
}
