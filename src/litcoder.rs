//! Context-modeled literal coder.
//!
//! Each literal byte is coded bit by bit through one of `1 << (lc + lp)`
//! sub-coders, selected by the low bits of the stream position (lp) and the
//! high bits of the previous byte (lc). Literals that directly follow a
//! match additionally condition on the byte the rep0 distance points at
//! ("matched" mode): while the decoded prefix agrees with that match byte
//! the coder uses a separate probability plane, and it falls back to the
//! normal plane at the first divergence.

use std::io::{self, Read, Write};

use crate::rangecoder::{get_price, new_probs, RangeDecoder, RangeEncoder};

/// One literal context: 0x300 probability cells (normal plane plus the two
/// match-bit planes).
#[derive(Debug, Clone)]
pub struct LitSubCoder {
    probs: Vec<u16>,
}

impl LitSubCoder {
    fn new() -> Self {
        Self {
            probs: new_probs(0x300),
        }
    }

    /// Decodes a literal in normal mode.
    pub fn decode_normal<R: Read>(&mut self, rd: &mut RangeDecoder<R>) -> io::Result<u8> {
        let mut symbol = 1u32;
        while symbol < 0x100 {
            symbol = symbol << 1 | rd.decode_bit(&mut self.probs, symbol as usize)?;
        }
        Ok(symbol as u8)
    }

    /// Decodes a literal in matched mode against `match_byte`.
    pub fn decode_matched<R: Read>(
        &mut self,
        rd: &mut RangeDecoder<R>,
        match_byte: u8,
    ) -> io::Result<u8> {
        let mut match_byte = u32::from(match_byte);
        let mut symbol = 1u32;
        while symbol < 0x100 {
            let match_bit = (match_byte >> 7) & 1;
            match_byte <<= 1;
            let bit =
                rd.decode_bit(&mut self.probs, (((1 + match_bit) << 8) + symbol) as usize)?;
            symbol = symbol << 1 | bit;
            if match_bit != bit {
                while symbol < 0x100 {
                    symbol = symbol << 1 | rd.decode_bit(&mut self.probs, symbol as usize)?;
                }
                break;
            }
        }
        Ok(symbol as u8)
    }

    /// Encodes a literal in normal mode.
    pub fn encode<W: Write>(&mut self, re: &mut RangeEncoder<W>, symbol: u8) -> io::Result<()> {
        let symbol = u32::from(symbol);
        let mut context = 1u32;
        for i in (0..8).rev() {
            let bit = (symbol >> i) & 1;
            re.encode_bit(&mut self.probs, context as usize, bit)?;
            context = context << 1 | bit;
        }
        Ok(())
    }

    /// Encodes a literal in matched mode against `match_byte`.
    pub fn encode_matched<W: Write>(
        &mut self,
        re: &mut RangeEncoder<W>,
        match_byte: u8,
        symbol: u8,
    ) -> io::Result<()> {
        let match_byte = u32::from(match_byte);
        let symbol = u32::from(symbol);
        let mut context = 1u32;
        let mut same = true;
        for i in (0..8).rev() {
            let bit = (symbol >> i) & 1;
            let mut state = context;
            if same {
                let match_bit = (match_byte >> i) & 1;
                state += (1 + match_bit) << 8;
                same = match_bit == bit;
            }
            re.encode_bit(&mut self.probs, state as usize, bit)?;
            context = context << 1 | bit;
        }
        Ok(())
    }

    /// Estimated cost of encoding `symbol`, in matched mode when
    /// `match_mode` is set.
    pub fn price(&self, match_mode: bool, match_byte: u8, symbol: u8) -> u32 {
        let match_byte = u32::from(match_byte);
        let symbol = u32::from(symbol);
        let mut price = 0u32;
        let mut context = 1u32;
        let mut i = 7i32;
        if match_mode {
            while i >= 0 {
                let match_bit = (match_byte >> i) & 1;
                let bit = (symbol >> i) & 1;
                price += get_price(
                    self.probs[(((1 + match_bit) << 8) + context) as usize],
                    bit,
                );
                context = context << 1 | bit;
                i -= 1;
                if match_bit != bit {
                    break;
                }
            }
        }
        while i >= 0 {
            let bit = (symbol >> i) & 1;
            price += get_price(self.probs[context as usize], bit);
            context = context << 1 | bit;
            i -= 1;
        }
        price
    }
}

/// The full literal coder: a table of sub-coders indexed by position and
/// previous byte.
#[derive(Debug)]
pub struct LitCoder {
    coders: Vec<LitSubCoder>,
    num_prev_bits: u32,
    pos_mask: u32,
}

impl LitCoder {
    /// Creates a coder with `num_pos_bits` (lp) and `num_prev_bits` (lc).
    pub fn new(num_pos_bits: u32, num_prev_bits: u32) -> Self {
        let num_states = 1usize << (num_prev_bits + num_pos_bits);
        Self {
            coders: vec![LitSubCoder::new(); num_states],
            num_prev_bits,
            pos_mask: (1 << num_pos_bits) - 1,
        }
    }

    /// Sub-coder for the literal at stream position `pos` following
    /// `prev_byte`.
    pub fn sub_coder(&mut self, pos: u32, prev_byte: u8) -> &mut LitSubCoder {
        // Widen before shifting so lc = 0 (shift by 8) is well defined.
        let index = ((pos & self.pos_mask) << self.num_prev_bits)
            + (u32::from(prev_byte) >> (8 - self.num_prev_bits));
        &mut self.coders[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_normal_roundtrip() {
        let bytes = b"Pack my box with five dozen liquor jugs";

        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut lc = LitCoder::new(0, 3);
        let mut prev = 0u8;
        for (pos, &b) in bytes.iter().enumerate() {
            lc.sub_coder(pos as u32, prev).encode(&mut re, b).unwrap();
            prev = b;
        }
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut lc = LitCoder::new(0, 3);
        let mut prev = 0u8;
        for (pos, &b) in bytes.iter().enumerate() {
            let got = lc.sub_coder(pos as u32, prev).decode_normal(&mut rd).unwrap();
            assert_eq!(got, b, "byte {pos}");
            prev = b;
        }
    }

    #[test]
    fn test_matched_roundtrip() {
        // Pair each literal with a match byte that shares a varying prefix.
        let pairs: &[(u8, u8)] = &[
            (0xAB, 0xAB),
            (0xAB, 0xA0),
            (0x00, 0xFF),
            (0x7F, 0x80),
            (0x55, 0x54),
        ];

        let mut out = Vec::new();
        let mut re = RangeEncoder::new(&mut out);
        let mut sub = LitSubCoder::new();
        for &(symbol, match_byte) in pairs {
            sub.encode_matched(&mut re, match_byte, symbol).unwrap();
        }
        re.flush().unwrap();

        let mut rd = RangeDecoder::new(Cursor::new(out)).unwrap();
        let mut sub = LitSubCoder::new();
        for &(symbol, match_byte) in pairs {
            assert_eq!(sub.decode_matched(&mut rd, match_byte).unwrap(), symbol);
        }
    }

    #[test]
    fn test_price_fresh_coder_is_eight_bits() {
        use crate::rangecoder::NUM_BIT_PRICE_SHIFT_BITS;
        let sub = LitSubCoder::new();
        assert_eq!(sub.price(false, 0, 0x42), 8 << NUM_BIT_PRICE_SHIFT_BITS);
        // Matched mode with a fully matching byte also walks 8 cells.
        assert_eq!(sub.price(true, 0x42, 0x42), 8 << NUM_BIT_PRICE_SHIFT_BITS);
    }

    #[test]
    fn test_sub_coder_selection_uses_prev_byte_high_bits() {
        let mut lc = LitCoder::new(2, 3);
        // Same position, different prev high bits must select different
        // sub-coders; poke one and check the other is untouched.
        lc.sub_coder(0, 0x00).probs[1] = 7;
        assert_ne!(lc.sub_coder(0, 0xE0).probs[1], 7);
        assert_eq!(lc.sub_coder(0, 0x1F).probs[1], 7);
    }
}
