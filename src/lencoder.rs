//! Match-length coder.
//!
//! A length symbol (`length - 2`, range 0..272) is split into three bands:
//! 0..8 ("low", 3 bits, per position state), 8..16 ("mid", 3 bits, per
//! position state) and 16..272 ("high", 8 bits, shared). Two choice bits
//! select the band. The encoder side additionally keeps a cached price
//! table per position state so the optimal parser can look lengths up
//! without re-walking the trees; the cache is rebuilt after `table_size`
//! symbols have been coded through it.

use std::io::{self, Read, Write};

use crate::constants::{
    NUM_HIGH_LEN_BITS, NUM_LEN_SYMBOLS, NUM_LOW_LEN_BITS, NUM_LOW_LEN_SYMBOLS, NUM_MID_LEN_BITS,
    NUM_MID_LEN_SYMBOLS, NUM_POS_STATES_MAX,
};
use crate::rangecoder::{get_price0, get_price1, new_probs, BitTreeCoder, RangeDecoder, RangeEncoder};

#[derive(Debug)]
pub struct LenCoder {
    choice: Vec<u16>,
    low_coder: Vec<BitTreeCoder>,
    mid_coder: Vec<BitTreeCoder>,
    high_coder: BitTreeCoder,
}

impl LenCoder {
    /// Creates a coder for `num_pos_states` (`1 << pb`) position contexts.
    pub fn new(num_pos_states: u32) -> Self {
        Self {
            choice: new_probs(2),
            low_coder: (0..num_pos_states)
                .map(|_| BitTreeCoder::new(NUM_LOW_LEN_BITS))
                .collect(),
            mid_coder: (0..num_pos_states)
                .map(|_| BitTreeCoder::new(NUM_MID_LEN_BITS))
                .collect(),
            high_coder: BitTreeCoder::new(NUM_HIGH_LEN_BITS),
        }
    }

    /// Decodes a length symbol (`length - 2`).
    pub fn decode<R: Read>(
        &mut self,
        rd: &mut RangeDecoder<R>,
        pos_state: u32,
    ) -> io::Result<u32> {
        if rd.decode_bit(&mut self.choice, 0)? == 0 {
            return self.low_coder[pos_state as usize].decode(rd);
        }
        if rd.decode_bit(&mut self.choice, 1)? == 0 {
            Ok(NUM_LOW_LEN_SYMBOLS + self.mid_coder[pos_state as usize].decode(rd)?)
        } else {
            Ok(NUM_LOW_LEN_SYMBOLS + NUM_MID_LEN_SYMBOLS + self.high_coder.decode(rd)?)
        }
    }

    /// Encodes a length symbol (`length - 2`).
    pub fn encode<W: Write>(
        &mut self,
        re: &mut RangeEncoder<W>,
        mut symbol: u32,
        pos_state: u32,
    ) -> io::Result<()> {
        if symbol < NUM_LOW_LEN_SYMBOLS {
            re.encode_bit(&mut self.choice, 0, 0)?;
            self.low_coder[pos_state as usize].encode(re, symbol)
        } else {
            symbol -= NUM_LOW_LEN_SYMBOLS;
            re.encode_bit(&mut self.choice, 0, 1)?;
            if symbol < NUM_MID_LEN_SYMBOLS {
                re.encode_bit(&mut self.choice, 1, 0)?;
                self.mid_coder[pos_state as usize].encode(re, symbol)
            } else {
                re.encode_bit(&mut self.choice, 1, 1)?;
                self.high_coder.encode(re, symbol - NUM_MID_LEN_SYMBOLS)
            }
        }
    }

    /// Fills `prices[st..st + num_symbols]` with the current cost of each
    /// length symbol for `pos_state`.
    fn set_prices(&self, prices: &mut [u32], pos_state: u32, num_symbols: u32, st: u32) {
        let a0 = get_price0(self.choice[0]);
        let a1 = get_price1(self.choice[0]);
        let b0 = a1 + get_price0(self.choice[1]);
        let b1 = a1 + get_price1(self.choice[1]);

        for i in 0..NUM_LOW_LEN_SYMBOLS.min(num_symbols) {
            prices[(st + i) as usize] = a0 + self.low_coder[pos_state as usize].price(i);
        }
        if num_symbols <= NUM_LOW_LEN_SYMBOLS {
            return;
        }
        for i in NUM_LOW_LEN_SYMBOLS..(NUM_LOW_LEN_SYMBOLS + NUM_MID_LEN_SYMBOLS).min(num_symbols)
        {
            prices[(st + i) as usize] =
                b0 + self.mid_coder[pos_state as usize].price(i - NUM_LOW_LEN_SYMBOLS);
        }
        for i in (NUM_LOW_LEN_SYMBOLS + NUM_MID_LEN_SYMBOLS)..num_symbols {
            prices[(st + i) as usize] =
                b1 + self.high_coder.price(i - NUM_LOW_LEN_SYMBOLS - NUM_MID_LEN_SYMBOLS);
        }
    }
}

/// Length coder with a cached per-position-state price table.
#[derive(Debug)]
pub struct LenPriceTableCoder {
    lc: LenCoder,
    prices: Vec<u32>,
    counters: Vec<u32>,
    table_size: u32,
}

impl LenPriceTableCoder {
    pub fn new(table_size: u32, num_pos_states: u32) -> Self {
        let mut pc = Self {
            lc: LenCoder::new(num_pos_states),
            prices: vec![0; (NUM_LEN_SYMBOLS * NUM_POS_STATES_MAX) as usize],
            counters: vec![0; NUM_POS_STATES_MAX as usize],
            table_size,
        };
        for pos_state in 0..num_pos_states {
            pc.update_table(pos_state);
        }
        pc
    }

    fn update_table(&mut self, pos_state: u32) {
        let st = pos_state * NUM_LEN_SYMBOLS;
        self.lc
            .set_prices(&mut self.prices, pos_state, self.table_size, st);
        self.counters[pos_state as usize] = self.table_size;
    }

    /// Cached price of length symbol `symbol` in `pos_state`.
    pub fn price(&self, symbol: u32, pos_state: u32) -> u32 {
        self.prices[(pos_state * NUM_LEN_SYMBOLS + symbol) as usize]
    }

    /// Encodes a symbol, refreshing the price cache when the per-state
    /// counter runs out.
    pub fn encode<W: Write>(
        &mut self,
        re: &mut RangeEncoder<W>,
        symbol: u32,
        pos_state: u32,
    ) -> io::Result<()> {
        self.lc.encode(re, symbol, pos_state)?;
        self.counters[pos_state as usize] -= 1;
        if self.counters[pos_state as usize] == 0 {
            self.update_table(pos_state);
        }
        Ok(())
    }
}
