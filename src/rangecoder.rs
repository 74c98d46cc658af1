//! Adaptive binary range coder and bit-tree coders.
//!
//! This module provides the entropy-coding layer shared by the encoder and
//! the decoder:
//!
//! - Adaptive probability cells (11-bit fixed point, shift-5 update rule)
//! - The range encoder (carry-propagating byte output) and its mirror
//!   decoder
//! - Bit-tree coders for fixed-width symbols, MSB-first and LSB-first
//! - The shared price table used for cost estimation by the optimal parser
//!
//! # Range Coding Overview
//!
//! Range coding represents a sequence of bits as a single number within a
//! shrinking interval. Each bit narrows the interval proportionally to its
//! modeled probability; whenever the interval gets too small, a byte is
//! shifted out (encoder) or shifted in (decoder). Both sides must apply the
//! exact same probability update and the same renormalization threshold or
//! the streams diverge.

use std::io::{self, Read, Write};
use std::sync::OnceLock;

/// Number of bits in a probability cell.
pub const NUM_BIT_MODEL_TOTAL_BITS: u32 = 11;

/// Total probability mass (2048).
pub const BIT_MODEL_TOTAL: u32 = 1 << NUM_BIT_MODEL_TOTAL_BITS;

/// Shift amount of the adaptive probability update.
pub const NUM_MOVE_BITS: u32 = 5;

/// Renormalization threshold: below this the coder shifts out a byte.
pub const TOP_VALUE: u32 = 1 << 24;

/// Initial probability value (50%).
pub const INITIAL_PROB: u16 = (BIT_MODEL_TOTAL / 2) as u16;

/// Probabilities are quantized by this shift when indexing the price table.
const NUM_MOVE_REDUCING_BITS: u32 = 2;

/// Fractional-bit resolution of prices (1 bit costs `1 << 6` price units).
pub const NUM_BIT_PRICE_SHIFT_BITS: u32 = 6;

/// A price no real coding path can reach.
pub const INFINITY_PRICE: u32 = 0x0FFF_FFFF;

/// Allocates `n` probability cells initialized to 50%.
pub fn new_probs(n: usize) -> Vec<u16> {
    vec![INITIAL_PROB; n]
}

static PROB_PRICES: OnceLock<[u32; (BIT_MODEL_TOTAL >> NUM_MOVE_REDUCING_BITS) as usize]> =
    OnceLock::new();

/// The quantized probability-to-price table, built once per process.
fn prob_prices() -> &'static [u32; (BIT_MODEL_TOTAL >> NUM_MOVE_REDUCING_BITS) as usize] {
    PROB_PRICES.get_or_init(|| {
        let mut table = [0u32; (BIT_MODEL_TOTAL >> NUM_MOVE_REDUCING_BITS) as usize];
        let num_bits = NUM_BIT_MODEL_TOTAL_BITS - NUM_MOVE_REDUCING_BITS;
        for i in (0..num_bits).rev() {
            let start = 1u32 << (num_bits - i - 1);
            let end = 1u32 << (num_bits - i);
            for j in start..end {
                table[j as usize] = (i << NUM_BIT_PRICE_SHIFT_BITS)
                    + (((end - j) << NUM_BIT_PRICE_SHIFT_BITS) >> (num_bits - i - 1));
            }
        }
        table
    })
}

/// Estimated cost of coding `bit` (0 or 1) against probability `prob`.
pub fn get_price(prob: u16, bit: u32) -> u32 {
    let p = u32::from(prob);
    prob_prices()[(((p.wrapping_sub(bit) ^ bit.wrapping_neg()) & (BIT_MODEL_TOTAL - 1))
        >> NUM_MOVE_REDUCING_BITS) as usize]
}

/// Estimated cost of coding a 0 bit against probability `prob`.
pub fn get_price0(prob: u16) -> u32 {
    prob_prices()[(u32::from(prob) >> NUM_MOVE_REDUCING_BITS) as usize]
}

/// Estimated cost of coding a 1 bit against probability `prob`.
pub fn get_price1(prob: u16) -> u32 {
    prob_prices()[((BIT_MODEL_TOTAL - u32::from(prob)) >> NUM_MOVE_REDUCING_BITS) as usize]
}

/// Range encoder writing to a byte sink.
///
/// Maintains the `[low, low + range)` working interval and a cache of
/// pending `0xFF` bytes awaiting carry resolution. [`flush`](Self::flush)
/// must be called to emit the final 5 bytes of state.
#[derive(Debug)]
pub struct RangeEncoder<W> {
    inner: W,
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
    written: u64,
}

impl<W: Write> RangeEncoder<W> {
    /// Creates a new range encoder writing to `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            low: 0,
            range: 0xFFFF_FFFF,
            cache: 0,
            cache_size: 1,
            written: 0,
        }
    }

    /// Total bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Encodes one bit against the adaptive probability at `probs[index]`.
    ///
    /// The cell moves toward 0 when a 1 is coded and toward
    /// [`BIT_MODEL_TOTAL`] when a 0 is coded.
    pub fn encode_bit(&mut self, probs: &mut [u16], index: usize, bit: u32) -> io::Result<()> {
        let prob = u32::from(probs[index]);
        let bound = (self.range >> NUM_BIT_MODEL_TOTAL_BITS) * prob;
        if bit == 0 {
            self.range = bound;
            probs[index] = (prob + ((BIT_MODEL_TOTAL - prob) >> NUM_MOVE_BITS)) as u16;
        } else {
            self.low += u64::from(bound);
            self.range -= bound;
            probs[index] = (prob - (prob >> NUM_MOVE_BITS)) as u16;
        }
        while self.range < TOP_VALUE {
            self.range <<= 8;
            self.shift_low()?;
        }
        Ok(())
    }

    /// Encodes `num_bits` raw bits of `value`, most significant first, at a
    /// fixed 50% probability. Used for the high-order distance bits.
    pub fn encode_direct_bits(&mut self, value: u32, num_bits: u32) -> io::Result<()> {
        for i in (0..num_bits).rev() {
            self.range >>= 1;
            if (value >> i) & 1 != 0 {
                self.low += u64::from(self.range);
            }
            if self.range < TOP_VALUE {
                self.range <<= 8;
                self.shift_low()?;
            }
        }
        Ok(())
    }

    /// Shifts the top byte of `low` out, propagating any pending carry
    /// through cached `0xFF` bytes.
    fn shift_low(&mut self) -> io::Result<()> {
        let low32 = self.low as u32;
        if low32 < 0xFF00_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u8;
            let mut byte = self.cache;
            loop {
                self.write_byte(byte.wrapping_add(carry))?;
                byte = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (low32 >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = u64::from(low32 & 0x00FF_FFFF) << 8;
        Ok(())
    }

    fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.inner.write_all(&[b])?;
        self.written += 1;
        Ok(())
    }

    /// Flushes the remaining coder state (5 bytes) to the sink.
    pub fn flush(&mut self) -> io::Result<()> {
        for _ in 0..5 {
            self.shift_low()?;
        }
        self.inner.flush()
    }
}

/// Range decoder reading from a byte source.
///
/// Mirrors [`RangeEncoder`]: same interval arithmetic, same probability
/// update, same renormalization threshold.
#[derive(Debug)]
pub struct RangeDecoder<R> {
    inner: R,
    range: u32,
    code: u32,
    read: u64,
}

impl<R: Read> RangeDecoder<R> {
    /// Creates a decoder, priming `code` from the first 5 stream bytes (the
    /// first of which is always zero in a well-formed stream).
    pub fn new(inner: R) -> io::Result<Self> {
        let mut rd = Self {
            inner,
            range: 0xFFFF_FFFF,
            code: 0,
            read: 0,
        };
        for _ in 0..5 {
            rd.code = rd.code << 8 | u32::from(rd.next_byte()?);
        }
        Ok(rd)
    }

    /// Total bytes consumed from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    fn next_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        self.read += 1;
        Ok(buf[0])
    }

    /// Decodes one bit against the adaptive probability at `probs[index]`.
    pub fn decode_bit(&mut self, probs: &mut [u16], index: usize) -> io::Result<u32> {
        let prob = u32::from(probs[index]);
        let bound = (self.range >> NUM_BIT_MODEL_TOTAL_BITS) * prob;
        let bit;
        if self.code < bound {
            self.range = bound;
            probs[index] = (prob + ((BIT_MODEL_TOTAL - prob) >> NUM_MOVE_BITS)) as u16;
            bit = 0;
        } else {
            self.code -= bound;
            self.range -= bound;
            probs[index] = (prob - (prob >> NUM_MOVE_BITS)) as u16;
            bit = 1;
        }
        if self.range < TOP_VALUE {
            self.code = self.code << 8 | u32::from(self.next_byte()?);
            self.range <<= 8;
        }
        Ok(bit)
    }

    /// Decodes `num_bits` raw 50%-probability bits, most significant first.
    pub fn decode_direct_bits(&mut self, num_bits: u32) -> io::Result<u32> {
        let mut result = 0u32;
        for _ in 0..num_bits {
            self.range >>= 1;
            let t = self.code.wrapping_sub(self.range) >> 31;
            self.code -= self.range & t.wrapping_sub(1);
            result = result << 1 | (1 - t);
            if self.range < TOP_VALUE {
                self.code = self.code << 8 | u32::from(self.next_byte()?);
                self.range <<= 8;
            }
        }
        Ok(result)
    }
}

/// Coder for a fixed-width unsigned symbol via a binary tree of probability
/// cells, one cell per tree node.
///
/// The "normal" direction walks the symbol MSB-first (used for posSlot and
/// length sub-symbols); the "reverse" direction walks LSB-first (used for
/// the low distance bits and the alignment suffix).
#[derive(Debug, Clone)]
pub struct BitTreeCoder {
    probs: Vec<u16>,
    num_bit_levels: u32,
}

impl BitTreeCoder {
    /// Creates a coder for `num_bit_levels`-bit symbols.
    pub fn new(num_bit_levels: u32) -> Self {
        Self {
            probs: new_probs(1 << num_bit_levels),
            num_bit_levels,
        }
    }

    /// Encodes `symbol` MSB-first.
    pub fn encode<W: Write>(&mut self, re: &mut RangeEncoder<W>, symbol: u32) -> io::Result<()> {
        let mut m = 1u32;
        for i in (0..self.num_bit_levels).rev() {
            let bit = (symbol >> i) & 1;
            re.encode_bit(&mut self.probs, m as usize, bit)?;
            m = m << 1 | bit;
        }
        Ok(())
    }

    /// Decodes a symbol MSB-first.
    pub fn decode<R: Read>(&mut self, rd: &mut RangeDecoder<R>) -> io::Result<u32> {
        let mut m = 1u32;
        for _ in 0..self.num_bit_levels {
            m = m << 1 | rd.decode_bit(&mut self.probs, m as usize)?;
        }
        Ok(m - (1 << self.num_bit_levels))
    }

    /// Encodes `symbol` LSB-first.
    pub fn reverse_encode<W: Write>(
        &mut self,
        re: &mut RangeEncoder<W>,
        symbol: u32,
    ) -> io::Result<()> {
        reverse_encode(re, &mut self.probs, 1, self.num_bit_levels, symbol)
    }

    /// Decodes a symbol LSB-first.
    pub fn reverse_decode<R: Read>(&mut self, rd: &mut RangeDecoder<R>) -> io::Result<u32> {
        reverse_decode(rd, &mut self.probs, 1, self.num_bit_levels)
    }

    /// Estimated cost of encoding `symbol` MSB-first, without touching the
    /// coder state. Tracks the adaptive cells, so estimates follow the model.
    pub fn price(&self, symbol: u32) -> u32 {
        let mut price = 0u32;
        let mut m = 1u32;
        for i in (0..self.num_bit_levels).rev() {
            let bit = (symbol >> i) & 1;
            price += get_price(self.probs[m as usize], bit);
            m = m << 1 | bit;
        }
        price
    }

    /// Estimated cost of encoding `symbol` LSB-first.
    pub fn reverse_price(&self, symbol: u32) -> u32 {
        reverse_price(&self.probs, 1, self.num_bit_levels, symbol)
    }
}

/// LSB-first bit-tree encode into a probability slice at `start`.
///
/// The distance pos coders share one flat cell array; the tree walk indexes
/// `start + m - 1` with `m >= 1`, so `start` is `base - posSlot` for the
/// distance coders (which is 0 for the first modeled slot) and 1 for a
/// coder-owned array.
pub fn reverse_encode<W: Write>(
    re: &mut RangeEncoder<W>,
    probs: &mut [u16],
    start: usize,
    num_bit_levels: u32,
    mut symbol: u32,
) -> io::Result<()> {
    let mut m = 1u32;
    for _ in 0..num_bit_levels {
        let bit = symbol & 1;
        re.encode_bit(probs, start + m as usize - 1, bit)?;
        m = m << 1 | bit;
        symbol >>= 1;
    }
    Ok(())
}

/// LSB-first bit-tree decode from a probability slice at `start`.
pub fn reverse_decode<R: Read>(
    rd: &mut RangeDecoder<R>,
    probs: &mut [u16],
    start: usize,
    num_bit_levels: u32,
) -> io::Result<u32> {
    let mut m = 1u32;
    let mut symbol = 0u32;
    for i in 0..num_bit_levels {
        let bit = rd.decode_bit(probs, start + m as usize - 1)?;
        m = m << 1 | bit;
        symbol |= bit << i;
    }
    Ok(symbol)
}

/// Price of an LSB-first encode against a probability slice at `start`.
pub fn reverse_price(probs: &[u16], start: usize, num_bit_levels: u32, mut symbol: u32) -> u32 {
    let mut price = 0u32;
    let mut m = 1u32;
    for _ in 0..num_bit_levels {
        let bit = symbol & 1;
        symbol >>= 1;
        price += get_price(probs[start + m as usize - 1], bit);
        m = m << 1 | bit;
    }
    price
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_probability_update_direction() {
        let mut re = RangeEncoder::new(Vec::new());
        let mut probs = new_probs(1);

        let initial = probs[0];
        re.encode_bit(&mut probs, 0, 0).unwrap();
        assert!(probs[0] > initial, "prob should increase for bit=0");

        let mid = probs[0];
        re.encode_bit(&mut probs, 0, 1).unwrap();
        assert!(probs[0] < mid, "prob should decrease for bit=1");
    }

    #[test]
    fn test_flush_produces_at_least_5_bytes() {
        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        re.flush().unwrap();
        assert!(out.len() >= 5);
    }

    #[test]
    fn test_bit_roundtrip() {
        let bits = [1u32, 0, 0, 1, 1, 1, 0, 1, 0, 0, 0, 0, 1, 1, 0, 1, 1, 1, 1, 0];

        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut probs = new_probs(2);
        for (i, &bit) in bits.iter().enumerate() {
            re.encode_bit(&mut probs, i & 1, bit).unwrap();
        }
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut probs = new_probs(2);
        for (i, &bit) in bits.iter().enumerate() {
            assert_eq!(rd.decode_bit(&mut probs, i & 1).unwrap(), bit, "bit {i}");
        }
    }

    #[test]
    fn test_direct_bits_roundtrip() {
        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        re.encode_direct_bits(0b1010, 4).unwrap();
        re.encode_direct_bits(0x1234_5678, 32).unwrap();
        re.encode_direct_bits(0x3FF_FFFF, 26).unwrap();
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        assert_eq!(rd.decode_direct_bits(4).unwrap(), 0b1010);
        assert_eq!(rd.decode_direct_bits(32).unwrap(), 0x1234_5678);
        assert_eq!(rd.decode_direct_bits(26).unwrap(), 0x3FF_FFFF);
    }

    #[test]
    fn test_bit_tree_roundtrip() {
        let symbols = [5u32, 0, 7, 3, 3, 3, 1, 6];

        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut tree = BitTreeCoder::new(3);
        let mut rev = BitTreeCoder::new(4);
        for &s in &symbols {
            tree.encode(&mut re, s).unwrap();
            rev.reverse_encode(&mut re, s).unwrap();
        }
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut tree = BitTreeCoder::new(3);
        let mut rev = BitTreeCoder::new(4);
        for &s in &symbols {
            assert_eq!(tree.decode(&mut rd).unwrap(), s);
            assert_eq!(rev.reverse_decode(&mut rd).unwrap(), s);
        }
    }

    #[test]
    fn test_reverse_helpers_at_slice_start() {
        // The first modeled distance slot has base == posSlot, so the tree
        // walk must start at cell 0 of the shared array.
        let symbols = [1u32, 0, 1, 1, 0];

        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut probs = new_probs(4);
        for &s in &symbols {
            reverse_encode(&mut re, &mut probs, 0, 1, s).unwrap();
        }
        re.flush().unwrap();
        assert!(reverse_price(&probs, 0, 1, 1) > 0);

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut probs = new_probs(4);
        for &s in &symbols {
            assert_eq!(reverse_decode(&mut rd, &mut probs, 0, 1).unwrap(), s);
        }
    }

    #[test]
    fn test_price_is_symmetric_at_even_odds() {
        assert_eq!(get_price0(INITIAL_PROB), get_price1(INITIAL_PROB));
        // One bit at 50% costs exactly one bit.
        assert_eq!(get_price0(INITIAL_PROB), 1 << NUM_BIT_PRICE_SHIFT_BITS);
    }

    #[test]
    fn test_price_tracks_probability() {
        // A likely zero is cheap to code as zero, expensive as one.
        let confident: u16 = 1900;
        assert!(get_price0(confident) < get_price1(confident));
        assert_eq!(get_price(confident, 0), get_price0(confident));
        assert_eq!(get_price(confident, 1), get_price1(confident));
    }

    #[test]
    fn test_tree_price_matches_bit_prices() {
        let tree = BitTreeCoder::new(2);
        // Fresh tree: every bit costs one bit, so a 2-bit symbol costs 2 bits.
        assert_eq!(tree.price(0b10), 2 << NUM_BIT_PRICE_SHIFT_BITS);
        assert_eq!(tree.reverse_price(0b01), 2 << NUM_BIT_PRICE_SHIFT_BITS);
    }

    #[test]
    fn test_carry_propagation_roundtrip() {
        // Alternating confident bits force long runs of 0xFF in low and
        // exercise the carry path.
        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut probs = new_probs(1);
        for i in 0..4096 {
            re.encode_bit(&mut probs, 0, (i / 7) & 1).unwrap();
        }
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut probs = new_probs(1);
        for i in 0..4096 {
            assert_eq!(rd.decode_bit(&mut probs, 0).unwrap(), (i / 7) & 1);
        }
    }
}
