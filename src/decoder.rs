//! Stream decoder.
//!
//! The decoder replays the encoder's model exactly: one probability-gated
//! decision tree per position, the same literal/length/distance coders, and
//! the same state machine. Output goes through an [`OutputWindow`] sized to
//! the dictionary declared in the header.

use std::io::{Read, Write};

use log::debug;

use crate::constants::{
    len_to_pos_state, END_POS_MODEL_INDEX, HEADER_SIZE, MATCH_MIN_LEN, NUM_ALIGN_BITS,
    NUM_FULL_DISTANCES, NUM_LEN_TO_POS_STATES, NUM_POS_SLOT_BITS, NUM_POS_STATES_BITS_MAX,
    NUM_STATES, START_POS_MODEL_INDEX,
};
use crate::error::{Error, Result};
use crate::header::Properties;
use crate::lencoder::LenCoder;
use crate::litcoder::LitCoder;
use crate::rangecoder::{new_probs, reverse_decode, BitTreeCoder, RangeDecoder};
use crate::state;
use crate::window::OutputWindow;

/// Decodes one stream: header, range-coded payload, optional end marker.
pub struct Decoder<R, W> {
    rd: RangeDecoder<R>,
    out: OutputWindow<W>,
    unpack_size: i64,

    is_match: Vec<u16>,
    is_rep: Vec<u16>,
    is_rep_g0: Vec<u16>,
    is_rep_g1: Vec<u16>,
    is_rep_g2: Vec<u16>,
    is_rep0_long: Vec<u16>,
    pos_slot_coders: Vec<BitTreeCoder>,
    pos_decoders: Vec<u16>,
    pos_align_coder: BitTreeCoder,
    len_coder: LenCoder,
    rep_len_coder: LenCoder,
    lit_coder: LitCoder,
    dict_size_check: u32,
    pos_state_mask: u32,
}

impl<R: Read, W: Write> Decoder<R, W> {
    /// Reads and validates the header, then sets up the model.
    pub fn new(mut inner: R, sink: W) -> Result<Self> {
        let (props, unpack_size) = Properties::read_header(&mut inner)?;
        debug!(
            "decoding stream: lc={} lp={} pb={} dict_size={} unpack_size={}",
            props.lc, props.lp, props.pb, props.dict_size, unpack_size
        );

        let rd = RangeDecoder::new(inner)
            .map_err(|e| Error::read(HEADER_SIZE as u64, e))?;

        let dict_size_check = props.dict_size.max(1);
        let out = OutputWindow::new(sink, dict_size_check.max(1 << 12));

        let num_pos_states = 1u32 << props.pb;
        Ok(Self {
            rd,
            out,
            unpack_size,
            is_match: new_probs((NUM_STATES << NUM_POS_STATES_BITS_MAX) as usize),
            is_rep: new_probs(NUM_STATES as usize),
            is_rep_g0: new_probs(NUM_STATES as usize),
            is_rep_g1: new_probs(NUM_STATES as usize),
            is_rep_g2: new_probs(NUM_STATES as usize),
            is_rep0_long: new_probs((NUM_STATES << NUM_POS_STATES_BITS_MAX) as usize),
            pos_slot_coders: (0..NUM_LEN_TO_POS_STATES)
                .map(|_| BitTreeCoder::new(NUM_POS_SLOT_BITS))
                .collect(),
            pos_decoders: new_probs((NUM_FULL_DISTANCES - END_POS_MODEL_INDEX) as usize),
            pos_align_coder: BitTreeCoder::new(NUM_ALIGN_BITS),
            len_coder: LenCoder::new(num_pos_states),
            rep_len_coder: LenCoder::new(num_pos_states),
            lit_coder: LitCoder::new(props.lp, props.lc),
            dict_size_check,
            pos_state_mask: num_pos_states - 1,
        })
    }

    fn read_err(&self, e: std::io::Error) -> Error {
        Error::read(HEADER_SIZE as u64 + self.rd.bytes_read(), e)
    }

    /// Decodes the whole stream, returning the number of bytes written.
    pub fn run(mut self) -> Result<u64> {
        let mut state = 0u32;
        let mut rep0 = 0u32;
        let mut rep1 = 0u32;
        let mut rep2 = 0u32;
        let mut rep3 = 0u32;
        let mut now_pos = 0u64;
        let mut prev_byte = 0u8;

        while self.unpack_size < 0 || (now_pos as i64) < self.unpack_size {
            let pos_state = (now_pos as u32) & self.pos_state_mask;
            let match_index = ((state << NUM_POS_STATES_BITS_MAX) + pos_state) as usize;

            let bit = self
                .rd
                .decode_bit(&mut self.is_match, match_index)
                .map_err(|e| self.read_err(e))?;
            if bit == 0 {
                let match_byte = self.out.get_byte(rep0);
                let sub = self.lit_coder.sub_coder(now_pos as u32, prev_byte);
                prev_byte = if state::is_char_state(state) {
                    sub.decode_normal(&mut self.rd)
                } else {
                    sub.decode_matched(&mut self.rd, match_byte)
                }
                .map_err(|e| Error::read(HEADER_SIZE as u64 + self.rd.bytes_read(), e))?;
                self.out
                    .put_byte(prev_byte)
                    .map_err(|e| Error::write(self.out.total_written(), e))?;
                state = state::after_char(state);
                now_pos += 1;
                continue;
            }

            let mut length;
            let is_rep = self
                .rd
                .decode_bit(&mut self.is_rep, state as usize)
                .map_err(|e| self.read_err(e))?;
            if is_rep == 0 {
                rep3 = rep2;
                rep2 = rep1;
                rep1 = rep0;
                length = self
                    .len_coder
                    .decode(&mut self.rd, pos_state)
                    .map_err(|e| self.read_err(e))?
                    + MATCH_MIN_LEN;
                state = state::after_match(state);
                let pos_slot = self.pos_slot_coders[len_to_pos_state(length) as usize]
                    .decode(&mut self.rd)
                    .map_err(|e| self.read_err(e))?;
                if pos_slot >= START_POS_MODEL_INDEX {
                    let num_direct_bits = (pos_slot >> 1) - 1;
                    rep0 = (2 | (pos_slot & 1)) << num_direct_bits;
                    if pos_slot < END_POS_MODEL_INDEX {
                        rep0 += reverse_decode(
                            &mut self.rd,
                            &mut self.pos_decoders,
                            (rep0 - pos_slot) as usize,
                            num_direct_bits,
                        )
                        .map_err(|e| self.read_err(e))?;
                    } else {
                        rep0 += self
                            .rd
                            .decode_direct_bits(num_direct_bits - NUM_ALIGN_BITS)
                            .map_err(|e| self.read_err(e))?
                            << NUM_ALIGN_BITS;
                        rep0 += self
                            .pos_align_coder
                            .reverse_decode(&mut self.rd)
                            .map_err(|e| self.read_err(e))?;
                        if (rep0 as i32) < 0 {
                            if rep0 == 0xFFFF_FFFF {
                                // End marker.
                                break;
                            }
                            return Err(Error::Stream(format!("invalid rep0 value: {rep0}")));
                        }
                    }
                } else {
                    rep0 = pos_slot;
                }
            } else {
                length = 0;
                let g0 = self
                    .rd
                    .decode_bit(&mut self.is_rep_g0, state as usize)
                    .map_err(|e| self.read_err(e))?;
                if g0 == 0 {
                    let long = self
                        .rd
                        .decode_bit(&mut self.is_rep0_long, match_index)
                        .map_err(|e| self.read_err(e))?;
                    if long == 0 {
                        state = state::after_short_rep(state);
                        length = 1;
                    }
                } else {
                    let distance;
                    let g1 = self
                        .rd
                        .decode_bit(&mut self.is_rep_g1, state as usize)
                        .map_err(|e| self.read_err(e))?;
                    if g1 == 0 {
                        distance = rep1;
                    } else {
                        let g2 = self
                            .rd
                            .decode_bit(&mut self.is_rep_g2, state as usize)
                            .map_err(|e| self.read_err(e))?;
                        if g2 == 0 {
                            distance = rep2;
                        } else {
                            distance = rep3;
                            rep3 = rep2;
                        }
                        rep2 = rep1;
                    }
                    rep1 = rep0;
                    rep0 = distance;
                }
                if length == 0 {
                    length = self
                        .rep_len_coder
                        .decode(&mut self.rd, pos_state)
                        .map_err(|e| self.read_err(e))?
                        + MATCH_MIN_LEN;
                    state = state::after_rep(state);
                }
            }

            if u64::from(rep0) >= now_pos {
                return Err(Error::Stream(format!(
                    "match distance {rep0} reaches before the start of the stream"
                )));
            }
            if rep0 >= self.dict_size_check {
                return Err(Error::Stream(format!(
                    "match distance {rep0} exceeds the dictionary size"
                )));
            }
            self.out
                .copy_block(rep0, length)
                .map_err(|e| Error::write(self.out.total_written(), e))?;
            now_pos += u64::from(length);
            prev_byte = self.out.get_byte(0);
        }

        self.out
            .flush()
            .map_err(|e| Error::write(self.out.total_written(), e))?;
        debug!(
            "decoded {} bytes from {} compressed",
            self.out.total_written(),
            HEADER_SIZE as u64 + self.rd.bytes_read()
        );
        Ok(self.out.total_written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Decoder::new(Cursor::new(data), &mut out)?.run()?;
        Ok(out)
    }

    #[test]
    fn test_rejects_truncated_header() {
        let err = decode(&[0x5D, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_rejects_bad_props_byte() {
        let mut data = vec![251u8];
        data.extend_from_slice(&(1u32 << 16).to_le_bytes());
        data.extend_from_slice(&0i64.to_le_bytes());
        data.extend_from_slice(&[0; 5]);
        assert!(matches!(decode(&data).unwrap_err(), Error::Header(_)));
    }

    #[test]
    fn test_size_zero_stream_decodes_empty() {
        // Header declaring zero bytes; the payload is just the coder flush.
        let mut data = vec![0x5D];
        data.extend_from_slice(&(1u32 << 16).to_le_bytes());
        data.extend_from_slice(&0i64.to_le_bytes());
        data.extend_from_slice(&[0; 5]);
        assert_eq!(decode(&data).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_match_before_stream_start_is_stream_error() {
        // A payload of 0xFF bytes decodes the first decision as a match,
        // which is invalid at position 0.
        let mut data = vec![0x5D];
        data.extend_from_slice(&(1u32 << 16).to_le_bytes());
        data.extend_from_slice(&100i64.to_le_bytes());
        data.extend_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0xFF; 32]);
        let err = decode(&data).unwrap_err();
        assert!(
            matches!(err, Error::Stream(_) | Error::Io { .. }),
            "unexpected error: {err:?}"
        );
    }
}
