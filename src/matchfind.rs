//! Binary-tree match finder (bt2/bt4).
//!
//! Candidate positions with the same hash are chained through a binary tree
//! stored in `son`, ordered by the bytes following the match so lookups both
//! find the longest matches and keep the tree balanced enough. bt4 hashes 4
//! bytes and additionally tracks dedicated 2-byte and 3-byte hash heads so
//! short matches at small distances are still found; bt2 hashes 2 bytes
//! directly and starts every tree probe from that guaranteed prefix.
//!
//! Matches are reported as (length, distance) pairs in strictly increasing
//! length order, which is exactly the shape the optimal parser consumes.

use std::io::{self, Read};
use std::sync::OnceLock;

use crate::window::InputWindow;

const HASH2_SIZE: u32 = 1 << 10;
const HASH3_SIZE: u32 = 1 << 16;
const BT2_HASH_SIZE: u32 = 1 << 16;
const START_MAX_LEN: u32 = 1;
const HASH3_OFFSET: u32 = HASH2_SIZE;
const EMPTY_HASH_VALUE: u32 = 0;
const MAX_VAL_FOR_NORMALIZE: u32 = (1 << 30) - 1;

static CRC_TABLE: OnceLock<[u32; 256]> = OnceLock::new();

fn crc_table() -> &'static [u32; 256] {
    CRC_TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut r = i as u32;
            for _ in 0..8 {
                if r & 1 != 0 {
                    r = (r >> 1) ^ 0xEDB8_8320;
                } else {
                    r >>= 1;
                }
            }
            *entry = r;
        }
        table
    })
}

/// Binary-tree match finder over an [`InputWindow`].
#[derive(Debug)]
pub struct BinTree<R> {
    iw: InputWindow<R>,
    son: Vec<u32>,
    hash: Vec<u32>,
    cyclic_buf_pos: u32,
    cyclic_buf_size: u32,
    match_max_len: u32,
    cut_value: u32,
    hash_mask: u32,
    num_hash_direct_bytes: u32,
    min_match_check: u32,
    fix_hash_size: u32,
    hash_array: bool,
}

impl<R: Read> BinTree<R> {
    /// Builds the finder over `inner`.
    ///
    /// `history_size` is the dictionary size; `keep_add_buf_before` and
    /// `keep_add_buf_after` extend the window margins for the parser's
    /// lookahead. `num_hash_bytes` selects bt2 (2) or bt4 (anything larger).
    pub fn new(
        inner: R,
        history_size: u32,
        keep_add_buf_before: u32,
        match_max_len: u32,
        keep_add_buf_after: u32,
        num_hash_bytes: u32,
    ) -> io::Result<Self> {
        let hash_array = num_hash_bytes > 2;
        let (num_hash_direct_bytes, min_match_check, fix_hash_size) = if hash_array {
            (0, 4, HASH2_SIZE + HASH3_SIZE)
        } else {
            (2, 3, 0)
        };

        let mut hash_mask = 0;
        let hash_size_sum = if hash_array {
            let mut hs = history_size - 1;
            hs |= hs >> 1;
            hs |= hs >> 2;
            hs |= hs >> 4;
            hs |= hs >> 8;
            hs >>= 1;
            hs |= 0xFFFF;
            if hs > 1 << 24 {
                hs >>= 1;
            }
            hash_mask = hs;
            hs + 1 + fix_hash_size
        } else {
            BT2_HASH_SIZE
        };

        let reserve = (history_size + keep_add_buf_before + match_max_len + keep_add_buf_after) / 2
            + 256;
        let mut iw = InputWindow::new(
            inner,
            history_size + keep_add_buf_before,
            match_max_len + keep_add_buf_after,
            reserve,
        )?;
        iw.reduce_offsets(0xFFFF_FFFF);

        Ok(Self {
            iw,
            son: vec![EMPTY_HASH_VALUE; ((history_size + 1) * 2) as usize],
            hash: vec![EMPTY_HASH_VALUE; hash_size_sum as usize],
            cyclic_buf_pos: 0,
            cyclic_buf_size: history_size + 1,
            match_max_len,
            cut_value: 16 + (match_max_len >> 1),
            hash_mask,
            num_hash_direct_bytes,
            min_match_check,
            fix_hash_size,
            hash_array,
        })
    }

    /// Bytes buffered ahead of the current position.
    pub fn available(&self) -> u32 {
        self.iw.available()
    }

    /// Byte at the signed offset from the current window position.
    pub fn byte_at(&self, index: i32) -> u8 {
        self.iw.byte_at(index)
    }

    /// Match length against `distance + 1` back, starting at `pos + index`.
    pub fn match_len(&self, index: i32, distance: u32, limit: u32) -> u32 {
        self.iw.match_len(index, distance, limit)
    }

    /// Total bytes consumed from the source.
    pub fn total_read(&self) -> u64 {
        self.iw.total_read()
    }

    fn normalize(&mut self) {
        let sub_value = self.iw.pos() - self.cyclic_buf_size;
        normalize_links(&mut self.son, sub_value);
        normalize_links(&mut self.hash, sub_value);
        self.iw.reduce_offsets(sub_value);
    }

    fn move_pos(&mut self) -> io::Result<()> {
        self.cyclic_buf_pos += 1;
        if self.cyclic_buf_pos >= self.cyclic_buf_size {
            self.cyclic_buf_pos = 0;
        }
        self.iw.move_pos()?;
        if self.iw.pos() == MAX_VAL_FOR_NORMALIZE {
            self.normalize();
        }
        Ok(())
    }

    fn hash_current(&mut self, cur: usize, update_short: bool) -> (u32, u32, u32) {
        let buf = self.iw.raw();
        if self.hash_array {
            let crc = crc_table();
            let mut tmp = crc[buf[cur] as usize] ^ u32::from(buf[cur + 1]);
            let hash2 = tmp & (HASH2_SIZE - 1);
            tmp ^= u32::from(buf[cur + 2]) << 8;
            let hash3 = tmp & (HASH3_SIZE - 1);
            let hash = (tmp ^ (crc[buf[cur + 3] as usize] << 5)) & self.hash_mask;
            if update_short {
                let pos = self.iw.pos();
                self.hash[hash2 as usize] = pos;
                self.hash[(HASH3_OFFSET + hash3) as usize] = pos;
            }
            (hash, hash2, hash3)
        } else {
            (u32::from(buf[cur]) ^ (u32::from(buf[cur + 1]) << 8), 0, 0)
        }
    }

    /// Collects all matches at the current position into `distances` as
    /// (length, distance) pairs with strictly increasing lengths, then
    /// advances the position by one. Returns the number of filled slots
    /// (twice the number of matches).
    pub fn matches(&mut self, distances: &mut [u32]) -> io::Result<u32> {
        let len_limit = if self.iw.pos() + self.match_max_len <= self.iw.stream_pos() {
            self.match_max_len
        } else {
            let limit = self.iw.stream_pos() - self.iw.pos();
            if limit < self.min_match_check {
                self.move_pos()?;
                return Ok(0);
            }
            limit
        };

        let mut offset = 0usize;
        let match_min_pos = if self.iw.pos() > self.cyclic_buf_size {
            self.iw.pos() - self.cyclic_buf_size
        } else {
            0
        };
        let cur = self.iw.buf_offset().wrapping_add(self.iw.pos()) as usize;
        let mut max_len = START_MAX_LEN;

        let (hash_value, hash2_value, hash3_value) = self.hash_current(cur, false);
        let mut cur_match = self.hash[(self.fix_hash_size + hash_value) as usize];

        if self.hash_array {
            let mut cur_match2 = self.hash[hash2_value as usize];
            let cur_match3 = self.hash[(HASH3_OFFSET + hash3_value) as usize];
            self.hash[hash2_value as usize] = self.iw.pos();
            self.hash[(HASH3_OFFSET + hash3_value) as usize] = self.iw.pos();
            let buf = self.iw.raw();
            if cur_match2 > match_min_pos
                && buf[self.iw.buf_offset().wrapping_add(cur_match2) as usize] == buf[cur]
            {
                max_len = 2;
                distances[offset] = max_len;
                distances[offset + 1] = self.iw.pos() - cur_match2 - 1;
                offset += 2;
            }
            if cur_match3 > match_min_pos
                && buf[self.iw.buf_offset().wrapping_add(cur_match3) as usize] == buf[cur]
            {
                if cur_match3 == cur_match2 {
                    offset -= 2;
                }
                max_len = 3;
                distances[offset] = max_len;
                distances[offset + 1] = self.iw.pos() - cur_match3 - 1;
                offset += 2;
                cur_match2 = cur_match3;
            }
            if offset != 0 && cur_match2 == cur_match {
                offset -= 2;
                max_len = START_MAX_LEN;
            }
        }

        self.hash[(self.fix_hash_size + hash_value) as usize] = self.iw.pos();

        if self.num_hash_direct_bytes != 0 && cur_match > match_min_pos {
            let buf = self.iw.raw();
            // The 2-byte hash is exact, so a differing third byte means a
            // length-2 match worth reporting on its own.
            if buf[self
                .iw
                .buf_offset()
                .wrapping_add(cur_match + self.num_hash_direct_bytes) as usize]
                != buf[cur + self.num_hash_direct_bytes as usize]
            {
                max_len = self.num_hash_direct_bytes;
                distances[offset] = max_len;
                distances[offset + 1] = self.iw.pos() - cur_match - 1;
                offset += 2;
            }
        }

        let mut ptr0 = (self.cyclic_buf_pos << 1) + 1;
        let mut ptr1 = self.cyclic_buf_pos << 1;
        let mut len0 = self.num_hash_direct_bytes;
        let mut len1 = self.num_hash_direct_bytes;
        let mut count = self.cut_value;

        loop {
            if cur_match <= match_min_pos || count == 0 {
                self.son[ptr1 as usize] = EMPTY_HASH_VALUE;
                self.son[ptr0 as usize] = EMPTY_HASH_VALUE;
                break;
            }
            count -= 1;

            let delta = self.iw.pos() - cur_match;
            let cyclic_pos = if delta <= self.cyclic_buf_pos {
                (self.cyclic_buf_pos - delta) << 1
            } else {
                (self.cyclic_buf_pos + self.cyclic_buf_size - delta) << 1
            };
            let pby1 = self.iw.buf_offset().wrapping_add(cur_match) as usize;
            let mut length = len0.min(len1);
            let buf = self.iw.raw();
            if buf[pby1 + length as usize] == buf[cur + length as usize] {
                length += 1;
                while length != len_limit
                    && buf[pby1 + length as usize] == buf[cur + length as usize]
                {
                    length += 1;
                }
                if max_len < length {
                    max_len = length;
                    distances[offset] = max_len;
                    distances[offset + 1] = delta - 1;
                    offset += 2;
                    if length == len_limit {
                        self.son[ptr1 as usize] = self.son[cyclic_pos as usize];
                        self.son[ptr0 as usize] = self.son[(cyclic_pos + 1) as usize];
                        break;
                    }
                }
            }

            if buf[pby1 + length as usize] < buf[cur + length as usize] {
                self.son[ptr1 as usize] = cur_match;
                ptr1 = cyclic_pos + 1;
                cur_match = self.son[ptr1 as usize];
                len1 = length;
            } else {
                self.son[ptr0 as usize] = cur_match;
                ptr0 = cyclic_pos;
                cur_match = self.son[ptr0 as usize];
                len0 = length;
            }
        }
        self.move_pos()?;
        Ok(offset as u32)
    }

    /// Advances `num` positions, updating the hash chains and trees without
    /// reporting matches.
    pub fn skip(&mut self, num: u32) -> io::Result<()> {
        for _ in 0..num {
            let len_limit = if self.iw.pos() + self.match_max_len <= self.iw.stream_pos() {
                self.match_max_len
            } else {
                let limit = self.iw.stream_pos() - self.iw.pos();
                if limit < self.min_match_check {
                    self.move_pos()?;
                    continue;
                }
                limit
            };

            let match_min_pos = if self.iw.pos() > self.cyclic_buf_size {
                self.iw.pos() - self.cyclic_buf_size
            } else {
                0
            };
            let cur = self.iw.buf_offset().wrapping_add(self.iw.pos()) as usize;

            let (hash_value, _, _) = self.hash_current(cur, true);
            let mut cur_match = self.hash[(self.fix_hash_size + hash_value) as usize];
            self.hash[(self.fix_hash_size + hash_value) as usize] = self.iw.pos();

            let mut ptr0 = (self.cyclic_buf_pos << 1) + 1;
            let mut ptr1 = self.cyclic_buf_pos << 1;
            let mut len0 = self.num_hash_direct_bytes;
            let mut len1 = self.num_hash_direct_bytes;
            let mut count = self.cut_value;
            loop {
                if cur_match <= match_min_pos || count == 0 {
                    self.son[ptr1 as usize] = EMPTY_HASH_VALUE;
                    self.son[ptr0 as usize] = EMPTY_HASH_VALUE;
                    break;
                }
                count -= 1;

                let delta = self.iw.pos() - cur_match;
                let cyclic_pos = if delta <= self.cyclic_buf_pos {
                    (self.cyclic_buf_pos - delta) << 1
                } else {
                    (self.cyclic_buf_pos + self.cyclic_buf_size - delta) << 1
                };
                let pby1 = self.iw.buf_offset().wrapping_add(cur_match) as usize;
                let mut length = len0.min(len1);
                let buf = self.iw.raw();
                if buf[pby1 + length as usize] == buf[cur + length as usize] {
                    length += 1;
                    while length != len_limit
                        && buf[pby1 + length as usize] == buf[cur + length as usize]
                    {
                        length += 1;
                    }
                    if length == len_limit {
                        self.son[ptr1 as usize] = self.son[cyclic_pos as usize];
                        self.son[ptr0 as usize] = self.son[(cyclic_pos + 1) as usize];
                        break;
                    }
                }

                if buf[pby1 + length as usize] < buf[cur + length as usize] {
                    self.son[ptr1 as usize] = cur_match;
                    ptr1 = cyclic_pos + 1;
                    cur_match = self.son[ptr1 as usize];
                    len1 = length;
                } else {
                    self.son[ptr0 as usize] = cur_match;
                    ptr0 = cyclic_pos;
                    cur_match = self.son[ptr0 as usize];
                    len0 = length;
                }
            }
            self.move_pos()?;
        }
        Ok(())
    }
}

/// Rebases one link array after a position-space normalize. Links at or
/// below `sub_value` fall out of the window and reset to empty.
fn normalize_links(links: &mut [u32], sub_value: u32) {
    for value in links.iter_mut() {
        *value = if *value <= sub_value {
            EMPTY_HASH_VALUE
        } else {
            *value - sub_value
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MATCH_MAX_LEN;
    use std::io::Cursor;

    fn bt4(data: &[u8]) -> BinTree<Cursor<Vec<u8>>> {
        BinTree::new(Cursor::new(data.to_vec()), 1 << 16, 4096, 64, MATCH_MAX_LEN + 1, 4)
            .unwrap()
    }

    #[test]
    fn test_crc_table_known_value() {
        // Standard reflected CRC-32 table entry for 1.
        assert_eq!(crc_table()[1], 0x7707_3096);
    }

    #[test]
    fn test_no_matches_in_unique_data() {
        let data: Vec<u8> = (0..64u8).collect();
        let mut bt = bt4(&data);
        let mut dist = [0u32; 16];
        for _ in 0..32 {
            assert_eq!(bt.matches(&mut dist).unwrap(), 0);
        }
    }

    #[test]
    fn test_finds_repeat_match() {
        let mut data = b"abcdefgh".to_vec();
        data.extend_from_slice(b"abcdefgh");
        data.extend_from_slice(b"xxxxxxxx");
        let mut bt = bt4(&data);
        let mut dist = [0u32; 64];
        for _ in 0..8 {
            bt.matches(&mut dist).unwrap();
        }
        // Position 8 repeats the first 8 bytes at distance 7 (encoded as
        // distance value 7 meaning 8 back).
        let n = bt.matches(&mut dist).unwrap();
        assert!(n >= 2, "expected at least one match, got {n}");
        let pairs: Vec<(u32, u32)> = dist[..n as usize]
            .chunks(2)
            .map(|c| (c[0], c[1]))
            .collect();
        assert!(
            pairs.iter().any(|&(len, d)| len == 8 && d == 7),
            "missing (8, 7) in {pairs:?}"
        );
        // Lengths strictly increase.
        for w in pairs.windows(2) {
            assert!(w[0].0 < w[1].0, "lengths not increasing: {pairs:?}");
        }
    }

    #[test]
    fn test_skip_keeps_chains_consistent() {
        let mut data = b"the quick brown fox ".to_vec();
        data.extend_from_slice(b"the quick brown fox ");
        let mut bt = bt4(&data);
        let mut dist = [0u32; 64];
        bt.matches(&mut dist).unwrap();
        bt.skip(19).unwrap();
        let n = bt.matches(&mut dist).unwrap();
        assert!(n >= 2);
        let (len, d) = (dist[n as usize - 2], dist[n as usize - 1]);
        assert_eq!(d, 19);
        assert_eq!(len, 20);
    }

    #[test]
    fn test_bt2_reports_two_byte_match() {
        let data = b"ababX".to_vec();
        let mut bt =
            BinTree::new(Cursor::new(data), 1 << 16, 4096, 64, MATCH_MAX_LEN + 1, 2).unwrap();
        let mut dist = [0u32; 16];
        bt.matches(&mut dist).unwrap();
        bt.matches(&mut dist).unwrap();
        let n = bt.matches(&mut dist).unwrap();
        assert!(n >= 2);
        assert_eq!(dist[n as usize - 1], 1);
    }

    #[test]
    fn test_matches_after_cyclic_buffer_wraps() {
        // A small history laps the cyclic pointer quickly, so tree walks see
        // chain entries older than the current cyclic position.
        let pattern: Vec<u8> = (0..23u8).collect();
        let data: Vec<u8> = pattern.iter().cycle().take(2000).copied().collect();
        let mut bt =
            BinTree::new(Cursor::new(data), 256, 64, 32, MATCH_MAX_LEN + 1, 4).unwrap();
        let mut dist = [0u32; 64];
        let mut found = false;
        for _ in 0..1900 {
            let n = bt.matches(&mut dist).unwrap();
            if n >= 2 {
                found = true;
                assert!(dist[n as usize - 1] < 256, "distance out of history");
            }
        }
        assert!(found, "no matches reported across the wrap");
    }

    #[test]
    fn test_normalize_links_resets_stale_entries() {
        let mut links = vec![0, 5, 10, 100];
        normalize_links(&mut links, 10);
        assert_eq!(links, vec![0, 0, 0, 90]);
    }

    #[test]
    fn test_long_run_match_capped_by_max_len() {
        let data = vec![b'z'; 600];
        let mut bt = bt4(&data);
        let mut dist = [0u32; 64];
        for _ in 0..4 {
            bt.matches(&mut dist).unwrap();
        }
        let n = bt.matches(&mut dist).unwrap();
        assert!(n >= 2);
        // match_max_len for this finder is 64.
        assert_eq!(dist[n as usize - 2], 64);
    }
}
