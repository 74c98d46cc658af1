//! Stream encoder with a price-driven optimal parser.
//!
//! The encoder runs a dynamic program over a window of up to 4096 upcoming
//! positions. Each node holds the cheapest known price to reach that
//! position plus the [`Step`] that got there; steps cover literals, short
//! reps, rep matches, normal matches, and the two fused lookahead shapes
//! (match-or-rep followed by one literal followed by a rep0). Prices come
//! from cached tables fed by the adaptive model, refreshed on a fixed
//! cadence so estimation cost stays bounded.
//!
//! Parsing and emission are decoupled: the parser produces a queue of
//! `(length, back)` tokens per DP window, and `code_one_block` drains the
//! queue through the range coder while keeping the model, the rep distance
//! history, and the match-finder offset in lockstep.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::OnceLock;

use log::debug;

use crate::constants::{
    len_to_pos_state, ALIGN_MASK, ALIGN_TABLE_SIZE, END_POS_MODEL_INDEX, HEADER_SIZE,
    MATCH_MAX_LEN, MATCH_MIN_LEN, NUM_ALIGN_BITS, NUM_FULL_DISTANCES, NUM_LEN_TO_POS_STATES,
    NUM_POS_SLOT_BITS, NUM_POS_STATES_BITS_MAX, NUM_REP_DISTANCES, NUM_STATES,
    START_POS_MODEL_INDEX,
};
use crate::error::{Error, Result};
use crate::header::EncoderOptions;
use crate::lencoder::LenPriceTableCoder;
use crate::litcoder::LitCoder;
use crate::matchfind::BinTree;
use crate::rangecoder::{
    get_price, get_price0, get_price1, new_probs, reverse_encode, reverse_price, BitTreeCoder,
    RangeEncoder, INFINITY_PRICE, NUM_BIT_PRICE_SHIFT_BITS,
};
use crate::state;

/// DP window size of the optimal parser.
const NUM_OPTS: u32 = 1 << 12;

/// Back token for a literal.
const BACK_LITERAL: u32 = u32::MAX;

static G_FAST_POS: OnceLock<[u8; 1 << 11]> = OnceLock::new();

/// Slot lookup table for distances below `1 << 11`; larger distances are
/// reduced by shifting before the lookup.
fn g_fast_pos() -> &'static [u8; 1 << 11] {
    G_FAST_POS.get_or_init(|| {
        let mut table = [0u8; 1 << 11];
        table[0] = 0;
        table[1] = 1;
        let mut c = 2usize;
        for slot_fast in 2u32..22 {
            let k = 1usize << ((slot_fast >> 1) - 1);
            for _ in 0..k {
                table[c] = slot_fast as u8;
                c += 1;
            }
        }
        table
    })
}

fn get_pos_slot(pos: u32) -> u32 {
    let t = g_fast_pos();
    if pos < 1 << 11 {
        u32::from(t[pos as usize])
    } else if pos < 1 << 21 {
        u32::from(t[(pos >> 10) as usize]) + 20
    } else {
        u32::from(t[(pos >> 20) as usize]) + 40
    }
}

fn get_pos_slot2(pos: u32) -> u32 {
    let t = g_fast_pos();
    if pos < 1 << 17 {
        u32::from(t[(pos >> 6) as usize]) + 12
    } else if pos < 1 << 27 {
        u32::from(t[(pos >> 16) as usize]) + 32
    } else {
        u32::from(t[(pos >> 26) as usize]) + 52
    }
}

/// How a DP node was reached from an earlier node.
///
/// `prev` is always the DP index the step departs from. The two fused
/// variants describe multi-token arrivals: `RepAfterLit` is a literal at
/// `prev - 1` followed by a rep0 spanning `prev..cur`, and
/// `RepAfterMatchLit` prepends a match or rep (encoded in `back`, rep index
/// below 4, otherwise distance plus 4) spanning `prev2..prev - 1`.
#[derive(Debug, Clone, Copy)]
enum Step {
    Literal { prev: u32 },
    ShortRep { prev: u32 },
    Rep { prev: u32, index: u32 },
    Match { prev: u32, dist: u32 },
    RepAfterLit { prev: u32 },
    RepAfterMatchLit { prev: u32, prev2: u32, back: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Node {
    price: u32,
    state: u32,
    backs: [u32; NUM_REP_DISTANCES],
    step: Step,
}

impl Node {
    fn reset() -> Self {
        Self {
            price: INFINITY_PRICE,
            state: 0,
            backs: [0; NUM_REP_DISTANCES],
            step: Step::Literal { prev: 0 },
        }
    }
}

/// Rep history after taking rep `index` from `backs`.
fn promote_rep(backs: [u32; NUM_REP_DISTANCES], index: u32) -> [u32; NUM_REP_DISTANCES] {
    match index {
        0 => backs,
        1 => [backs[1], backs[0], backs[2], backs[3]],
        2 => [backs[2], backs[0], backs[1], backs[3]],
        _ => [backs[3], backs[0], backs[1], backs[2]],
    }
}

/// Compresses one stream: header, range-coded payload, optional end marker.
#[derive(Debug)]
pub struct Encoder<R, W> {
    re: RangeEncoder<W>,
    mf: BinTree<R>,

    fast_bytes: u32,
    write_end_mark: bool,

    nodes: Vec<Node>,
    tokens: VecDeque<(u32, u32)>,

    is_match: Vec<u16>,
    is_rep: Vec<u16>,
    is_rep_g0: Vec<u16>,
    is_rep_g1: Vec<u16>,
    is_rep_g2: Vec<u16>,
    is_rep0_long: Vec<u16>,
    pos_slot_coders: Vec<BitTreeCoder>,
    pos_coders: Vec<u16>,
    pos_align_coder: BitTreeCoder,
    len_coder: LenPriceTableCoder,
    rep_len_coder: LenPriceTableCoder,
    lit_coder: LitCoder,

    match_distances: Vec<u32>,
    longest_match_len: u32,
    num_distance_pairs: u32,
    longest_match_found: bool,
    additional_offset: u32,

    pos_slot_prices: Vec<u32>,
    distances_prices: Vec<u32>,
    align_prices: Vec<u32>,
    align_price_count: u32,
    match_price_count: u32,
    dist_table_size: u32,

    pos_state_mask: u32,
    now_pos: i64,
    finished: bool,
    state: u32,
    prev_byte: u8,
    rep_distances: [u32; NUM_REP_DISTANCES],

    reps: [u32; NUM_REP_DISTANCES],
    rep_lens: [u32; NUM_REP_DISTANCES],
    back_res: u32,
}

impl<R: Read, W: Write> Encoder<R, W> {
    /// Validates `opts`, writes the 13-byte header, and builds the model.
    ///
    /// `size` is the exact uncompressed size, or `-1` when unknown; unknown
    /// size streams are terminated with an end marker instead.
    pub fn new(inner: R, mut sink: W, size: i64, opts: EncoderOptions) -> Result<Self> {
        opts.validate()?;
        if size < -1 {
            return Err(Error::InvalidArgument {
                msg: "uncompressed size must be -1 or nonnegative",
                value: size,
            });
        }

        let props = opts.properties();
        props
            .write_header(&mut sink, size)
            .map_err(|e| Error::write(0, e))?;

        let dict_size = opts.dict_size();
        let mf = BinTree::new(
            inner,
            dict_size,
            NUM_OPTS,
            opts.fast_bytes,
            MATCH_MAX_LEN + 1,
            opts.match_finder.num_hash_bytes(),
        )
        .map_err(|e| Error::read(0, e))?;

        debug!(
            "encoding stream: dict_size={} fast_bytes={} lc={} lp={} pb={} size={}",
            dict_size, opts.fast_bytes, opts.lc, opts.lp, opts.pb, size
        );

        let num_pos_states = 1u32 << opts.pb;
        let len_table_size = opts.fast_bytes + 1 - MATCH_MIN_LEN;
        let mut z = Self {
            re: RangeEncoder::new(sink),
            mf,
            fast_bytes: opts.fast_bytes,
            write_end_mark: size == -1,
            nodes: vec![Node::reset(); NUM_OPTS as usize],
            tokens: VecDeque::new(),
            is_match: new_probs((NUM_STATES << NUM_POS_STATES_BITS_MAX) as usize),
            is_rep: new_probs(NUM_STATES as usize),
            is_rep_g0: new_probs(NUM_STATES as usize),
            is_rep_g1: new_probs(NUM_STATES as usize),
            is_rep_g2: new_probs(NUM_STATES as usize),
            is_rep0_long: new_probs((NUM_STATES << NUM_POS_STATES_BITS_MAX) as usize),
            pos_slot_coders: (0..NUM_LEN_TO_POS_STATES)
                .map(|_| BitTreeCoder::new(NUM_POS_SLOT_BITS))
                .collect(),
            pos_coders: new_probs((NUM_FULL_DISTANCES - END_POS_MODEL_INDEX) as usize),
            pos_align_coder: BitTreeCoder::new(NUM_ALIGN_BITS),
            len_coder: LenPriceTableCoder::new(len_table_size, num_pos_states),
            rep_len_coder: LenPriceTableCoder::new(len_table_size, num_pos_states),
            lit_coder: LitCoder::new(opts.lp, opts.lc),
            match_distances: vec![0; (MATCH_MAX_LEN * 2 + 2) as usize],
            longest_match_len: 0,
            num_distance_pairs: 0,
            longest_match_found: false,
            additional_offset: 0,
            pos_slot_prices: vec![0; 1 << (NUM_POS_SLOT_BITS + 2)],
            distances_prices: vec![0; (NUM_FULL_DISTANCES * NUM_LEN_TO_POS_STATES) as usize],
            align_prices: vec![0; ALIGN_TABLE_SIZE as usize],
            align_price_count: 0,
            match_price_count: 0,
            dist_table_size: opts.dict_size_log2 * 2,
            pos_state_mask: num_pos_states - 1,
            now_pos: 0,
            finished: false,
            state: 0,
            prev_byte: 0,
            rep_distances: [0; NUM_REP_DISTANCES],
            reps: [0; NUM_REP_DISTANCES],
            rep_lens: [0; NUM_REP_DISTANCES],
            back_res: 0,
        };
        z.fill_distances_prices();
        z.fill_align_prices();
        Ok(z)
    }

    /// Runs the whole stream through, returning the total compressed size
    /// including the header.
    pub fn run(mut self) -> Result<u64> {
        while !self.finished {
            self.code_one_block()?;
        }
        let total = HEADER_SIZE as u64 + self.re.bytes_written();
        debug!("encoded {} bytes to {} compressed", self.now_pos, total);
        Ok(total)
    }

    fn read_err(&self, e: std::io::Error) -> Error {
        Error::read(self.mf.total_read(), e)
    }

    fn write_err(&self, e: std::io::Error) -> Error {
        Error::write(HEADER_SIZE as u64 + self.re.bytes_written(), e)
    }

    /// Pulls the matches at the next position. Returns the longest match
    /// length, extended past `fast_bytes` by direct comparison when the
    /// finder capped out.
    fn read_match_distances(&mut self) -> Result<u32> {
        let mut len_res = 0;
        self.num_distance_pairs = self
            .mf
            .matches(&mut self.match_distances)
            .map_err(|e| self.read_err(e))?;
        if self.num_distance_pairs > 0 {
            len_res = self.match_distances[(self.num_distance_pairs - 2) as usize];
            if len_res == self.fast_bytes {
                len_res += self.mf.match_len(
                    len_res as i32 - 1,
                    self.match_distances[(self.num_distance_pairs - 1) as usize],
                    MATCH_MAX_LEN - len_res,
                );
            }
        }
        self.additional_offset += 1;
        Ok(len_res)
    }

    fn move_pos(&mut self, num: u32) -> Result<()> {
        if num > 0 {
            self.additional_offset += num;
            self.mf.skip(num).map_err(|e| self.read_err(e))?;
        }
        Ok(())
    }

    fn is_match_index(state: u32, pos_state: u32) -> usize {
        ((state << NUM_POS_STATES_BITS_MAX) + pos_state) as usize
    }

    /// Price of selecting rep `rep_index`, excluding the length.
    fn pure_rep_price(&self, rep_index: u32, state: u32, pos_state: u32) -> u32 {
        if rep_index == 0 {
            get_price0(self.is_rep_g0[state as usize])
                + get_price1(self.is_rep0_long[Self::is_match_index(state, pos_state)])
        } else {
            let mut price = get_price1(self.is_rep_g0[state as usize]);
            if rep_index == 1 {
                price += get_price0(self.is_rep_g1[state as usize]);
            } else {
                price += get_price1(self.is_rep_g1[state as usize]);
                price += get_price(self.is_rep_g2[state as usize], rep_index - 2);
            }
            price
        }
    }

    fn rep_price(&self, rep_index: u32, length: u32, state: u32, pos_state: u32) -> u32 {
        self.rep_len_coder.price(length - MATCH_MIN_LEN, pos_state)
            + self.pure_rep_price(rep_index, state, pos_state)
    }

    fn pos_len_price(&self, pos: u32, length: u32, pos_state: u32) -> u32 {
        let len_to_pos_state = len_to_pos_state(length);
        let price = if pos < NUM_FULL_DISTANCES {
            self.distances_prices[(len_to_pos_state * NUM_FULL_DISTANCES + pos) as usize]
        } else {
            self.pos_slot_prices
                [((len_to_pos_state << NUM_POS_SLOT_BITS) + get_pos_slot2(pos)) as usize]
                + self.align_prices[(pos & ALIGN_MASK) as usize]
        };
        price + self.len_coder.price(length - MATCH_MIN_LEN, pos_state)
    }

    fn rep_len1_price(&self, state: u32, pos_state: u32) -> u32 {
        get_price0(self.is_rep_g0[state as usize])
            + get_price0(self.is_rep0_long[Self::is_match_index(state, pos_state)])
    }

    /// Walks the cheapest path from node `cur` back to node 0, queueing the
    /// `(length, back)` tokens in stream order, and returns the first one.
    fn backward(&mut self, cur: u32) -> (u32, u32) {
        let mut pos = cur;
        while pos != 0 {
            match self.nodes[pos as usize].step {
                Step::Literal { prev } => {
                    self.tokens.push_front((1, BACK_LITERAL));
                    pos = prev;
                }
                Step::ShortRep { prev } => {
                    self.tokens.push_front((1, 0));
                    pos = prev;
                }
                Step::Rep { prev, index } => {
                    self.tokens.push_front((pos - prev, index));
                    pos = prev;
                }
                Step::Match { prev, dist } => {
                    self.tokens
                        .push_front((pos - prev, dist + NUM_REP_DISTANCES as u32));
                    pos = prev;
                }
                Step::RepAfterLit { prev } => {
                    self.tokens.push_front((pos - prev, 0));
                    self.tokens.push_front((1, BACK_LITERAL));
                    pos = prev - 1;
                }
                Step::RepAfterMatchLit { prev, prev2, back } => {
                    self.tokens.push_front((pos - prev, 0));
                    self.tokens.push_front((1, BACK_LITERAL));
                    self.tokens.push_front((prev - 1 - prev2, back));
                    pos = prev2;
                }
            }
        }
        // The queue cannot be empty: cur >= 2 always yields a token.
        let (len, back) = self.tokens.pop_front().unwrap_or((1, BACK_LITERAL));
        self.back_res = back;
        (len, back)
    }

    /// Finds the next token to emit at stream `position`. Sets
    /// `self.back_res` and returns the token length.
    ///
    /// Fast paths bypass the DP entirely: a rep or match already at least
    /// `fast_bytes` long is taken greedily, and positions with no viable
    /// match fall out as literals.
    fn optimize(&mut self, mut position: u32) -> Result<u32> {
        if let Some((len, back)) = self.tokens.pop_front() {
            self.back_res = back;
            return Ok(len);
        }

        let len_main = if self.longest_match_found {
            self.longest_match_found = false;
            self.longest_match_len
        } else {
            self.read_match_distances()?
        };
        let mut num_distance_pairs = self.num_distance_pairs;

        let available_bytes = self.mf.available() + 1;
        if available_bytes < 2 {
            self.back_res = BACK_LITERAL;
            return Ok(1);
        }

        let mut rep_max_index = 0usize;
        for i in 0..NUM_REP_DISTANCES {
            self.reps[i] = self.rep_distances[i];
            self.rep_lens[i] = self.mf.match_len(-1, self.reps[i], MATCH_MAX_LEN);
            if self.rep_lens[i] > self.rep_lens[rep_max_index] {
                rep_max_index = i;
            }
        }
        if self.rep_lens[rep_max_index] >= self.fast_bytes {
            self.back_res = rep_max_index as u32;
            let len_res = self.rep_lens[rep_max_index];
            self.move_pos(len_res - 1)?;
            return Ok(len_res);
        }

        if len_main >= self.fast_bytes {
            self.back_res = self.match_distances[(num_distance_pairs - 1) as usize]
                + NUM_REP_DISTANCES as u32;
            self.move_pos(len_main - 1)?;
            return Ok(len_main);
        }

        let mut cur_byte = self.mf.byte_at(-1);
        let mut match_byte = self.mf.byte_at(-(self.rep_distances[0] as i32) - 2);
        if len_main < 2 && cur_byte != match_byte && self.rep_lens[rep_max_index] < 2 {
            self.back_res = BACK_LITERAL;
            return Ok(1);
        }

        self.nodes[0].state = self.state;
        let mut pos_state = position & self.pos_state_mask;
        self.nodes[1].price = get_price0(self.is_match[Self::is_match_index(self.state, pos_state)])
            + self
                .lit_coder
                .sub_coder(position, self.prev_byte)
                .price(!state::is_char_state(self.state), match_byte, cur_byte);
        self.nodes[1].step = Step::Literal { prev: 0 };

        let mut match_price =
            get_price1(self.is_match[Self::is_match_index(self.state, pos_state)]);
        let mut rep_match_price = match_price + get_price1(self.is_rep[self.state as usize]);
        if match_byte == cur_byte {
            let short_rep_price = rep_match_price + self.rep_len1_price(self.state, pos_state);
            if short_rep_price < self.nodes[1].price {
                self.nodes[1].price = short_rep_price;
                self.nodes[1].step = Step::ShortRep { prev: 0 };
            }
        }

        let mut len_end = len_main.max(self.rep_lens[rep_max_index]);
        if len_end < 2 {
            self.back_res = match self.nodes[1].step {
                Step::ShortRep { .. } => 0,
                _ => BACK_LITERAL,
            };
            return Ok(1);
        }

        self.nodes[0].backs = self.reps;
        for length in 2..=len_end {
            self.nodes[length as usize].price = INFINITY_PRICE;
        }

        for i in 0..NUM_REP_DISTANCES {
            let mut rep_len = self.rep_lens[i];
            if rep_len < 2 {
                continue;
            }
            let price = rep_match_price + self.pure_rep_price(i as u32, self.state, pos_state);
            while rep_len >= 2 {
                let cur_and_len_price =
                    price + self.rep_len_coder.price(rep_len - 2, pos_state);
                let node = &mut self.nodes[rep_len as usize];
                if cur_and_len_price < node.price {
                    node.price = cur_and_len_price;
                    node.step = Step::Rep {
                        prev: 0,
                        index: i as u32,
                    };
                }
                rep_len -= 1;
            }
        }

        let mut normal_match_price = match_price + get_price0(self.is_rep[self.state as usize]);
        let start = if self.rep_lens[0] >= 2 {
            self.rep_lens[0] + 1
        } else {
            2
        };
        if start <= len_main {
            let mut offs = 0usize;
            while start > self.match_distances[offs] {
                offs += 2;
            }
            let mut length = start;
            loop {
                let distance = self.match_distances[offs + 1];
                let cur_and_len_price =
                    normal_match_price + self.pos_len_price(distance, length, pos_state);
                let node = &mut self.nodes[length as usize];
                if cur_and_len_price < node.price {
                    node.price = cur_and_len_price;
                    node.step = Step::Match {
                        prev: 0,
                        dist: distance,
                    };
                }
                if length == self.match_distances[offs] {
                    offs += 2;
                    if offs as u32 == num_distance_pairs {
                        break;
                    }
                }
                length += 1;
            }
        }

        let mut cur = 0u32;
        loop {
            cur += 1;
            if cur == len_end {
                let (len, _) = self.backward(cur);
                return Ok(len);
            }

            let mut new_len = self.read_match_distances()?;
            num_distance_pairs = self.num_distance_pairs;
            if new_len >= self.fast_bytes {
                self.longest_match_len = new_len;
                self.longest_match_found = true;
                let (len, _) = self.backward(cur);
                return Ok(len);
            }

            position += 1;

            // Reconstruct the model state and rep history at this node from
            // the step that reached it.
            let (state, reps) = match self.nodes[cur as usize].step {
                Step::Literal { prev } => (
                    state::after_char(self.nodes[prev as usize].state),
                    self.nodes[prev as usize].backs,
                ),
                Step::ShortRep { prev } => (
                    state::after_short_rep(self.nodes[prev as usize].state),
                    self.nodes[prev as usize].backs,
                ),
                Step::Rep { prev, index } => (
                    state::after_rep(self.nodes[prev as usize].state),
                    promote_rep(self.nodes[prev as usize].backs, index),
                ),
                Step::Match { prev, dist } => {
                    let b = self.nodes[prev as usize].backs;
                    (
                        state::after_match(self.nodes[prev as usize].state),
                        [dist, b[0], b[1], b[2]],
                    )
                }
                Step::RepAfterLit { prev } => {
                    let base = &self.nodes[(prev - 1) as usize];
                    (
                        state::after_rep(state::after_char(base.state)),
                        base.backs,
                    )
                }
                Step::RepAfterMatchLit { prev: _, prev2, back } => {
                    let base = self.nodes[prev2 as usize];
                    let s = if back < NUM_REP_DISTANCES as u32 {
                        state::after_rep(base.state)
                    } else {
                        state::after_match(base.state)
                    };
                    let reps = if back < NUM_REP_DISTANCES as u32 {
                        promote_rep(base.backs, back)
                    } else {
                        [
                            back - NUM_REP_DISTANCES as u32,
                            base.backs[0],
                            base.backs[1],
                            base.backs[2],
                        ]
                    };
                    (state::after_rep(state::after_char(s)), reps)
                }
            };
            self.reps = reps;
            self.nodes[cur as usize].state = state;
            self.nodes[cur as usize].backs = self.reps;

            let cur_price = self.nodes[cur as usize].price;
            cur_byte = self.mf.byte_at(-1);
            match_byte = self.mf.byte_at(-(self.reps[0] as i32) - 2);
            pos_state = position & self.pos_state_mask;

            let prev_lit_byte = self.mf.byte_at(-2);
            let cur_and_1_price = cur_price
                + get_price0(self.is_match[Self::is_match_index(state, pos_state)])
                + self.lit_coder.sub_coder(position, prev_lit_byte).price(
                    !state::is_char_state(state),
                    match_byte,
                    cur_byte,
                );

            let mut next_is_char = false;
            if cur_and_1_price < self.nodes[(cur + 1) as usize].price {
                let next = &mut self.nodes[(cur + 1) as usize];
                next.price = cur_and_1_price;
                next.step = Step::Literal { prev: cur };
                next_is_char = true;
            }

            match_price = cur_price + get_price1(self.is_match[Self::is_match_index(state, pos_state)]);
            rep_match_price = match_price + get_price1(self.is_rep[state as usize]);

            // A short rep is redundant when the next node already arrives
            // via a rep0-shaped step from an earlier position.
            let next_arrives_as_rep0 = matches!(
                self.nodes[(cur + 1) as usize].step,
                Step::ShortRep { .. }
                    | Step::RepAfterLit { .. }
                    | Step::RepAfterMatchLit { .. }
                    | Step::Rep { index: 0, .. }
            );
            if match_byte == cur_byte && !next_arrives_as_rep0 {
                let short_rep_price = rep_match_price + self.rep_len1_price(state, pos_state);
                if short_rep_price <= self.nodes[(cur + 1) as usize].price {
                    let next = &mut self.nodes[(cur + 1) as usize];
                    next.price = short_rep_price;
                    next.step = Step::ShortRep { prev: cur };
                    next_is_char = true;
                }
            }

            let mut available_bytes_full = self.mf.available() + 1;
            available_bytes_full = available_bytes_full.min(NUM_OPTS - 1 - cur);
            let mut available_bytes = available_bytes_full;
            if available_bytes < 2 {
                continue;
            }
            if available_bytes > self.fast_bytes {
                available_bytes = self.fast_bytes;
            }

            // Literal followed by a rep0: worth probing only when the
            // literal is not already the best arrival.
            if !next_is_char && match_byte != cur_byte {
                let t = (available_bytes_full - 1).min(self.fast_bytes);
                let len_test2 = self.mf.match_len(0, self.reps[0], t);
                if len_test2 >= 2 {
                    let state2 = state::after_char(state);
                    let pos_state_next = (position + 1) & self.pos_state_mask;
                    let next_rep_match_price = cur_and_1_price
                        + get_price1(self.is_match[Self::is_match_index(state2, pos_state_next)])
                        + get_price1(self.is_rep[state2 as usize]);
                    let offset = cur + 1 + len_test2;
                    while len_end < offset {
                        len_end += 1;
                        self.nodes[len_end as usize].price = INFINITY_PRICE;
                    }
                    let cur_and_len_price = next_rep_match_price
                        + self.rep_price(0, len_test2, state2, pos_state_next);
                    let node = &mut self.nodes[offset as usize];
                    if cur_and_len_price < node.price {
                        node.price = cur_and_len_price;
                        node.step = Step::RepAfterLit { prev: cur + 1 };
                    }
                }
            }

            let mut start_len = 2u32;
            for rep_index in 0..NUM_REP_DISTANCES as u32 {
                let len_test_full =
                    self.mf
                        .match_len(-1, self.reps[rep_index as usize], available_bytes);
                if len_test_full < 2 {
                    continue;
                }

                while len_end < cur + len_test_full {
                    len_end += 1;
                    self.nodes[len_end as usize].price = INFINITY_PRICE;
                }
                let mut len_test = len_test_full;
                while len_test >= 2 {
                    let cur_and_len_price =
                        rep_match_price + self.rep_price(rep_index, len_test, state, pos_state);
                    let node = &mut self.nodes[(cur + len_test) as usize];
                    if cur_and_len_price < node.price {
                        node.price = cur_and_len_price;
                        node.step = Step::Rep {
                            prev: cur,
                            index: rep_index,
                        };
                    }
                    len_test -= 1;
                }

                let len_test = len_test_full;
                if rep_index == 0 {
                    start_len = len_test + 1;
                }

                // Rep, one literal, then rep0 again.
                if len_test < available_bytes_full {
                    let t = (available_bytes_full - 1 - len_test).min(self.fast_bytes);
                    let len_test2 =
                        self.mf
                            .match_len(len_test as i32, self.reps[rep_index as usize], t);
                    if len_test2 >= 2 {
                        let mut state2 = state::after_rep(state);
                        let mut pos_state_next = (position + len_test) & self.pos_state_mask;
                        let lit_prev = self.mf.byte_at(len_test as i32 - 2);
                        let lit_match = self.mf.byte_at(
                            len_test as i32 - 1 - (self.reps[rep_index as usize] as i32 + 1),
                        );
                        let lit_cur = self.mf.byte_at(len_test as i32 - 1);
                        let cur_and_len_char_price = rep_match_price
                            + self.rep_price(rep_index, len_test, state, pos_state)
                            + get_price0(
                                self.is_match[Self::is_match_index(state2, pos_state_next)],
                            )
                            + self
                                .lit_coder
                                .sub_coder(position + len_test, lit_prev)
                                .price(true, lit_match, lit_cur);
                        state2 = state::after_char(state2);
                        pos_state_next = (position + len_test + 1) & self.pos_state_mask;
                        let next_match_price = cur_and_len_char_price
                            + get_price1(
                                self.is_match[Self::is_match_index(state2, pos_state_next)],
                            );
                        let next_rep_match_price =
                            next_match_price + get_price1(self.is_rep[state2 as usize]);

                        let offset = len_test + 1 + len_test2;
                        while len_end < cur + offset {
                            len_end += 1;
                            self.nodes[len_end as usize].price = INFINITY_PRICE;
                        }
                        let cur_and_len_price = next_rep_match_price
                            + self.rep_price(0, len_test2, state2, pos_state_next);
                        let node = &mut self.nodes[(cur + offset) as usize];
                        if cur_and_len_price < node.price {
                            node.price = cur_and_len_price;
                            node.step = Step::RepAfterMatchLit {
                                prev: cur + len_test + 1,
                                prev2: cur,
                                back: rep_index,
                            };
                        }
                    }
                }
            }

            if new_len > available_bytes {
                new_len = available_bytes;
                num_distance_pairs = 0;
                while new_len > self.match_distances[num_distance_pairs as usize] {
                    num_distance_pairs += 2;
                }
                self.match_distances[num_distance_pairs as usize] = new_len;
                num_distance_pairs += 2;
            }
            if new_len < start_len {
                continue;
            }

            normal_match_price = match_price + get_price0(self.is_rep[state as usize]);
            while len_end < cur + new_len {
                len_end += 1;
                self.nodes[len_end as usize].price = INFINITY_PRICE;
            }
            let mut offs = 0usize;
            while start_len > self.match_distances[offs] {
                offs += 2;
            }

            let mut len_test = start_len;
            loop {
                let cur_back = self.match_distances[offs + 1];
                let cur_and_len_price =
                    normal_match_price + self.pos_len_price(cur_back, len_test, pos_state);
                let node = &mut self.nodes[(cur + len_test) as usize];
                if cur_and_len_price < node.price {
                    node.price = cur_and_len_price;
                    node.step = Step::Match {
                        prev: cur,
                        dist: cur_back,
                    };
                }

                if len_test == self.match_distances[offs] {
                    // Match, one literal, then a rep0.
                    if len_test < available_bytes_full {
                        let t = (available_bytes_full - 1 - len_test).min(self.fast_bytes);
                        let len_test2 = self.mf.match_len(len_test as i32, cur_back, t);
                        if len_test2 >= 2 {
                            let mut state2 = state::after_match(state);
                            let mut pos_state_next =
                                (position + len_test) & self.pos_state_mask;
                            let lit_prev = self.mf.byte_at(len_test as i32 - 2);
                            let lit_match =
                                self.mf.byte_at(len_test as i32 - (cur_back as i32 + 1) - 1);
                            let lit_cur = self.mf.byte_at(len_test as i32 - 1);
                            let cur_and_len_char_price = cur_and_len_price
                                + get_price0(
                                    self.is_match[Self::is_match_index(state2, pos_state_next)],
                                )
                                + self
                                    .lit_coder
                                    .sub_coder(position + len_test, lit_prev)
                                    .price(true, lit_match, lit_cur);
                            state2 = state::after_char(state2);
                            pos_state_next = (position + len_test + 1) & self.pos_state_mask;
                            let next_match_price = cur_and_len_char_price
                                + get_price1(
                                    self.is_match[Self::is_match_index(state2, pos_state_next)],
                                );
                            let next_rep_match_price =
                                next_match_price + get_price1(self.is_rep[state2 as usize]);
                            let offset = len_test + 1 + len_test2;
                            while len_end < cur + offset {
                                len_end += 1;
                                self.nodes[len_end as usize].price = INFINITY_PRICE;
                            }
                            let fused_price = next_rep_match_price
                                + self.rep_price(0, len_test2, state2, pos_state_next);
                            let node = &mut self.nodes[(cur + offset) as usize];
                            if fused_price < node.price {
                                node.price = fused_price;
                                node.step = Step::RepAfterMatchLit {
                                    prev: cur + len_test + 1,
                                    prev2: cur,
                                    back: cur_back + NUM_REP_DISTANCES as u32,
                                };
                            }
                        }
                    }
                    offs += 2;
                    if offs as u32 == num_distance_pairs {
                        break;
                    }
                }
                len_test += 1;
            }
        }
    }

    fn fill_distances_prices(&mut self) {
        let mut temp_prices = [0u32; NUM_FULL_DISTANCES as usize];
        for i in START_POS_MODEL_INDEX..NUM_FULL_DISTANCES {
            let pos_slot = get_pos_slot(i);
            let footer_bits = (pos_slot >> 1) - 1;
            let base_val = (2 | (pos_slot & 1)) << footer_bits;
            temp_prices[i as usize] = reverse_price(
                &self.pos_coders,
                (base_val - pos_slot) as usize,
                footer_bits,
                i - base_val,
            );
        }
        for len_to_pos_state in 0..NUM_LEN_TO_POS_STATES {
            let st = len_to_pos_state << NUM_POS_SLOT_BITS;
            for pos_slot in 0..self.dist_table_size {
                self.pos_slot_prices[(st + pos_slot) as usize] =
                    self.pos_slot_coders[len_to_pos_state as usize].price(pos_slot);
            }
            for pos_slot in END_POS_MODEL_INDEX..self.dist_table_size {
                self.pos_slot_prices[(st + pos_slot) as usize] +=
                    ((pos_slot >> 1) - 1 - NUM_ALIGN_BITS) << NUM_BIT_PRICE_SHIFT_BITS;
            }
            let st2 = len_to_pos_state * NUM_FULL_DISTANCES;
            for i in 0..START_POS_MODEL_INDEX {
                self.distances_prices[(st2 + i) as usize] =
                    self.pos_slot_prices[(st + i) as usize];
            }
            for i in START_POS_MODEL_INDEX..NUM_FULL_DISTANCES {
                self.distances_prices[(st2 + i) as usize] = self.pos_slot_prices
                    [(st + get_pos_slot(i)) as usize]
                    + temp_prices[i as usize];
            }
        }
        self.match_price_count = 0;
    }

    fn fill_align_prices(&mut self) {
        for i in 0..ALIGN_TABLE_SIZE {
            self.align_prices[i as usize] = self.pos_align_coder.reverse_price(i);
        }
        self.align_price_count = 0;
    }

    /// Codes the end-of-stream marker: a match with the impossible distance
    /// `0xFFFFFFFF` (posSlot 63, all-ones footer).
    fn write_end_marker(&mut self, pos_state: u32) -> Result<()> {
        if !self.write_end_mark {
            return Ok(());
        }
        self.re
            .encode_bit(
                &mut self.is_match,
                Self::is_match_index(self.state, pos_state),
                1,
            )
            .map_err(|e| self.write_err(e))?;
        self.re
            .encode_bit(&mut self.is_rep, self.state as usize, 0)
            .map_err(|e| self.write_err(e))?;
        self.state = state::after_match(self.state);
        self.len_coder
            .encode(&mut self.re, 0, pos_state)
            .map_err(|e| self.write_err(e))?;
        let pos_slot = (1 << NUM_POS_SLOT_BITS) - 1;
        let len_to_pos_state = len_to_pos_state(MATCH_MIN_LEN);
        self.pos_slot_coders[len_to_pos_state as usize]
            .encode(&mut self.re, pos_slot)
            .map_err(|e| self.write_err(e))?;
        let footer_bits = 30u32;
        let pos_reduced = (1u32 << footer_bits) - 1;
        self.re
            .encode_direct_bits(pos_reduced >> NUM_ALIGN_BITS, footer_bits - NUM_ALIGN_BITS)
            .map_err(|e| self.write_err(e))?;
        self.pos_align_coder
            .reverse_encode(&mut self.re, pos_reduced & ALIGN_MASK)
            .map_err(|e| self.write_err(e))?;
        Ok(())
    }

    fn flush(&mut self, now_pos: u32) -> Result<()> {
        self.write_end_marker(now_pos & self.pos_state_mask)?;
        self.re.flush().map_err(|e| self.write_err(e))
    }

    /// Encodes until the source is exhausted or roughly 4 KiB of output
    /// positions have been coded, whichever comes first.
    fn code_one_block(&mut self) -> Result<()> {
        self.finished = true;
        let progress_pos_prev = self.now_pos;
        if self.now_pos == 0 {
            if self.mf.available() == 0 {
                return self.flush(0);
            }
            // The very first byte has no history, so it is always a plain
            // literal coded outside the parser.
            self.read_match_distances()?;
            let pos_state = (self.now_pos as u32) & self.pos_state_mask;
            self.re
                .encode_bit(
                    &mut self.is_match,
                    Self::is_match_index(self.state, pos_state),
                    0,
                )
                .map_err(|e| self.write_err(e))?;
            self.state = state::after_char(self.state);
            let cur_byte = self.mf.byte_at(-(self.additional_offset as i32));
            self.lit_coder
                .sub_coder(self.now_pos as u32, self.prev_byte)
                .encode(&mut self.re, cur_byte)
                .map_err(|e| self.write_err(e))?;
            self.prev_byte = cur_byte;
            self.additional_offset -= 1;
            self.now_pos += 1;
        }
        if self.mf.available() == 0 {
            return self.flush(self.now_pos as u32);
        }
        loop {
            let length = self.optimize(self.now_pos as u32)?;
            let mut pos = self.back_res;
            let pos_state = (self.now_pos as u32) & self.pos_state_mask;
            let complex_state = Self::is_match_index(self.state, pos_state);

            if length == 1 && pos == BACK_LITERAL {
                self.re
                    .encode_bit(&mut self.is_match, complex_state, 0)
                    .map_err(|e| self.write_err(e))?;
                let cur_byte = self.mf.byte_at(-(self.additional_offset as i32));
                let match_byte = self
                    .mf
                    .byte_at(-(self.rep_distances[0] as i32) - 1 - self.additional_offset as i32);
                let char_state = state::is_char_state(self.state);
                let sub = self
                    .lit_coder
                    .sub_coder(self.now_pos as u32, self.prev_byte);
                if char_state {
                    sub.encode(&mut self.re, cur_byte)
                } else {
                    sub.encode_matched(&mut self.re, match_byte, cur_byte)
                }
                .map_err(|e| self.write_err(e))?;
                self.prev_byte = cur_byte;
                self.state = state::after_char(self.state);
            } else {
                self.re
                    .encode_bit(&mut self.is_match, complex_state, 1)
                    .map_err(|e| self.write_err(e))?;
                if pos < NUM_REP_DISTANCES as u32 {
                    self.re
                        .encode_bit(&mut self.is_rep, self.state as usize, 1)
                        .map_err(|e| self.write_err(e))?;
                    if pos == 0 {
                        self.re
                            .encode_bit(&mut self.is_rep_g0, self.state as usize, 0)
                            .map_err(|e| self.write_err(e))?;
                        let long_bit = u32::from(length != 1);
                        self.re
                            .encode_bit(&mut self.is_rep0_long, complex_state, long_bit)
                            .map_err(|e| self.write_err(e))?;
                    } else {
                        self.re
                            .encode_bit(&mut self.is_rep_g0, self.state as usize, 1)
                            .map_err(|e| self.write_err(e))?;
                        if pos == 1 {
                            self.re
                                .encode_bit(&mut self.is_rep_g1, self.state as usize, 0)
                                .map_err(|e| self.write_err(e))?;
                        } else {
                            self.re
                                .encode_bit(&mut self.is_rep_g1, self.state as usize, 1)
                                .map_err(|e| self.write_err(e))?;
                            self.re
                                .encode_bit(&mut self.is_rep_g2, self.state as usize, pos - 2)
                                .map_err(|e| self.write_err(e))?;
                        }
                    }
                    if length == 1 {
                        self.state = state::after_short_rep(self.state);
                    } else {
                        self.rep_len_coder
                            .encode(&mut self.re, length - MATCH_MIN_LEN, pos_state)
                            .map_err(|e| self.write_err(e))?;
                        self.state = state::after_rep(self.state);
                    }
                    let distance = self.rep_distances[pos as usize];
                    if pos != 0 {
                        for i in (1..=pos as usize).rev() {
                            self.rep_distances[i] = self.rep_distances[i - 1];
                        }
                        self.rep_distances[0] = distance;
                    }
                } else {
                    self.re
                        .encode_bit(&mut self.is_rep, self.state as usize, 0)
                        .map_err(|e| self.write_err(e))?;
                    self.state = state::after_match(self.state);
                    self.len_coder
                        .encode(&mut self.re, length - MATCH_MIN_LEN, pos_state)
                        .map_err(|e| self.write_err(e))?;
                    pos -= NUM_REP_DISTANCES as u32;
                    let pos_slot = get_pos_slot(pos);
                    let len_to_pos_state = len_to_pos_state(length);
                    self.pos_slot_coders[len_to_pos_state as usize]
                        .encode(&mut self.re, pos_slot)
                        .map_err(|e| self.write_err(e))?;
                    if pos_slot >= START_POS_MODEL_INDEX {
                        let footer_bits = (pos_slot >> 1) - 1;
                        let base_val = (2 | (pos_slot & 1)) << footer_bits;
                        let pos_reduced = pos - base_val;
                        if pos_slot < END_POS_MODEL_INDEX {
                            reverse_encode(
                                &mut self.re,
                                &mut self.pos_coders,
                                (base_val - pos_slot) as usize,
                                footer_bits,
                                pos_reduced,
                            )
                            .map_err(|e| self.write_err(e))?;
                        } else {
                            self.re
                                .encode_direct_bits(
                                    pos_reduced >> NUM_ALIGN_BITS,
                                    footer_bits - NUM_ALIGN_BITS,
                                )
                                .map_err(|e| self.write_err(e))?;
                            self.pos_align_coder
                                .reverse_encode(&mut self.re, pos_reduced & ALIGN_MASK)
                                .map_err(|e| self.write_err(e))?;
                            self.align_price_count += 1;
                        }
                    }
                    for i in (1..NUM_REP_DISTANCES).rev() {
                        self.rep_distances[i] = self.rep_distances[i - 1];
                    }
                    self.rep_distances[0] = pos;
                    self.match_price_count += 1;
                }
                self.prev_byte = self
                    .mf
                    .byte_at(length as i32 - 1 - self.additional_offset as i32);
            }
            self.additional_offset -= length;
            self.now_pos += i64::from(length);
            if self.additional_offset == 0 {
                if self.match_price_count >= 1 << 7 {
                    self.fill_distances_prices();
                }
                if self.align_price_count >= ALIGN_TABLE_SIZE {
                    self.fill_align_prices();
                }
                if self.mf.available() == 0 {
                    return self.flush(self.now_pos as u32);
                }
                if self.now_pos - progress_pos_prev >= 1 << 12 {
                    self.finished = false;
                    debug!("block boundary at {} uncompressed bytes", self.now_pos);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;
    use std::io::Cursor;

    fn roundtrip(data: &[u8], size: i64, level: u32) -> Vec<u8> {
        let opts = EncoderOptions::from_level(level).unwrap();
        let mut compressed = Vec::new();
        Encoder::new(Cursor::new(data), &mut compressed, size, opts)
            .unwrap()
            .run()
            .unwrap();
        let mut out = Vec::new();
        Decoder::new(Cursor::new(compressed), &mut out)
            .unwrap()
            .run()
            .unwrap();
        out
    }

    #[test]
    fn test_fast_pos_matches_slot_definition() {
        // A distance's slot encodes its two top bits plus the bit length.
        assert_eq!(get_pos_slot(0), 0);
        assert_eq!(get_pos_slot(1), 1);
        assert_eq!(get_pos_slot(2), 2);
        assert_eq!(get_pos_slot(3), 3);
        assert_eq!(get_pos_slot(4), 4);
        assert_eq!(get_pos_slot(5), 4);
        assert_eq!(get_pos_slot(96), 13);
        assert_eq!(get_pos_slot(1 << 20), 40);
        for pos in [100u32, 5000, 1 << 15, (1 << 24) + 17] {
            assert_eq!(get_pos_slot(pos), get_pos_slot2(pos), "pos {pos}");
        }
    }

    #[test]
    fn test_promote_rep_orders() {
        let backs = [10, 20, 30, 40];
        assert_eq!(promote_rep(backs, 0), [10, 20, 30, 40]);
        assert_eq!(promote_rep(backs, 1), [20, 10, 30, 40]);
        assert_eq!(promote_rep(backs, 2), [30, 10, 20, 40]);
        assert_eq!(promote_rep(backs, 3), [40, 10, 20, 30]);
    }

    #[test]
    fn test_empty_known_size_is_header_plus_flush() {
        let opts = EncoderOptions::from_level(1).unwrap();
        let mut compressed = Vec::new();
        Encoder::new(Cursor::new(&b""[..]), &mut compressed, 0, opts)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(compressed.len(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_roundtrip_short_text() {
        let data = b"hello, hello, hello world";
        assert_eq!(roundtrip(data, data.len() as i64, 1), data);
    }

    #[test]
    fn test_roundtrip_unknown_size() {
        let data = b"the end marker path: size is not declared up front";
        assert_eq!(roundtrip(data, -1, 1), data);
    }

    #[test]
    fn test_run_length_input_compresses() {
        let data = vec![b'a'; 1000];
        let opts = EncoderOptions::from_level(1).unwrap();
        let mut compressed = Vec::new();
        Encoder::new(Cursor::new(&data[..]), &mut compressed, 1000, opts)
            .unwrap()
            .run()
            .unwrap();
        assert!(
            compressed.len() < 100,
            "1000 repeated bytes took {} bytes",
            compressed.len()
        );
    }

    #[test]
    fn test_rejects_bad_size() {
        let opts = EncoderOptions::from_level(1).unwrap();
        let err = Encoder::new(Cursor::new(&b""[..]), Vec::new(), -2, opts).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_deterministic_output() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 31 % 251) as u8).collect();
        let opts = EncoderOptions::from_level(2).unwrap();
        let mut a = Vec::new();
        Encoder::new(Cursor::new(&data[..]), &mut a, data.len() as i64, opts)
            .unwrap()
            .run()
            .unwrap();
        let mut b = Vec::new();
        Encoder::new(Cursor::new(&data[..]), &mut b, data.len() as i64, opts)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(a, b);
    }
}
