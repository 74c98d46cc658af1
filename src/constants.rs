//! Shared constants of the LZMA stream format.
//!
//! These values are fixed by the wire format: both the encoder and the
//! decoder must agree on every one of them, byte for byte. They are grouped
//! here instead of being scattered across the coder modules.

/// Number of remembered rep distances.
pub const NUM_REP_DISTANCES: usize = 4;

/// Number of states in the literal/match FSM.
pub const NUM_STATES: u32 = 12;

/// Bits in a posSlot symbol.
pub const NUM_POS_SLOT_BITS: u32 = 6;

/// Bits selecting the length-to-posSlot context.
pub const NUM_LEN_TO_POS_STATES_BITS: u32 = 2;

/// Number of length-to-posSlot contexts.
pub const NUM_LEN_TO_POS_STATES: u32 = 1 << NUM_LEN_TO_POS_STATES_BITS;

/// Shortest encodable match.
pub const MATCH_MIN_LEN: u32 = 2;

/// Bits in the distance alignment suffix.
pub const NUM_ALIGN_BITS: u32 = 4;

/// Size of the alignment coder table.
pub const ALIGN_TABLE_SIZE: u32 = 1 << NUM_ALIGN_BITS;

/// Mask extracting the alignment suffix of a distance.
pub const ALIGN_MASK: u32 = ALIGN_TABLE_SIZE - 1;

/// First posSlot that carries extra distance bits.
pub const START_POS_MODEL_INDEX: u32 = 4;

/// First posSlot whose extra bits are coded directly instead of modeled.
pub const END_POS_MODEL_INDEX: u32 = 14;

/// Distances below this bound are fully covered by the modeled pos coders.
pub const NUM_FULL_DISTANCES: u32 = 1 << (END_POS_MODEL_INDEX / 2);

/// Maximum literal context bits (lc).
pub const NUM_LIT_CONTEXT_BITS_MAX: u32 = 8;

/// Maximum position state bits (pb), also the shift used when combining
/// `state` and `posState` into one probability index.
pub const NUM_POS_STATES_BITS_MAX: u32 = 4;

/// Maximum number of position states.
pub const NUM_POS_STATES_MAX: u32 = 1 << NUM_POS_STATES_BITS_MAX;

/// Bits of a low-range length symbol.
pub const NUM_LOW_LEN_BITS: u32 = 3;

/// Bits of a mid-range length symbol.
pub const NUM_MID_LEN_BITS: u32 = 3;

/// Bits of a high-range length symbol.
pub const NUM_HIGH_LEN_BITS: u32 = 8;

/// Number of low-range length symbols.
pub const NUM_LOW_LEN_SYMBOLS: u32 = 1 << NUM_LOW_LEN_BITS;

/// Number of mid-range length symbols.
pub const NUM_MID_LEN_SYMBOLS: u32 = 1 << NUM_MID_LEN_BITS;

/// Total number of length symbols.
pub const NUM_LEN_SYMBOLS: u32 = NUM_LOW_LEN_SYMBOLS + NUM_MID_LEN_SYMBOLS + (1 << NUM_HIGH_LEN_BITS);

/// Longest encodable match (273).
pub const MATCH_MAX_LEN: u32 = MATCH_MIN_LEN + NUM_LEN_SYMBOLS - 1;

/// Size of the LZMA properties field (props byte + 4-byte dictionary size).
pub const PROP_SIZE: usize = 5;

/// Size of the full stream header (properties + 8-byte uncompressed size).
pub const HEADER_SIZE: usize = PROP_SIZE + 8;

/// Maps a match length to the posSlot coder context it selects.
///
/// Lengths 2..=4 each get their own context; everything longer shares the
/// last one.
pub fn len_to_pos_state(length: u32) -> u32 {
    let len = length - MATCH_MIN_LEN;
    if len < NUM_LEN_TO_POS_STATES {
        len
    } else {
        NUM_LEN_TO_POS_STATES - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        assert_eq!(NUM_FULL_DISTANCES, 128);
        assert_eq!(NUM_LEN_SYMBOLS, 272);
        assert_eq!(MATCH_MAX_LEN, 273);
        assert_eq!(HEADER_SIZE, 13);
    }

    #[test]
    fn test_len_to_pos_state() {
        assert_eq!(len_to_pos_state(2), 0);
        assert_eq!(len_to_pos_state(3), 1);
        assert_eq!(len_to_pos_state(4), 2);
        assert_eq!(len_to_pos_state(5), 3);
        assert_eq!(len_to_pos_state(273), 3);
    }
}
