//! Sliding-window buffers for the encoder and the decoder.
//!
//! [`InputWindow`] is the encoder side: a lookahead ring over the raw
//! source with a history margin behind the current position (for the match
//! finder) and a lookahead margin ahead of it. [`OutputWindow`] is the
//! decoder side: a dictionary-sized ring that materializes back-references
//! with overlap-tolerant copies and flushes completed bytes to the sink.

use std::io::{self, Read, Write};

/// Encoder-side lookahead window.
///
/// The buffer holds `keep_size_before` bytes of history plus
/// `keep_size_after` bytes of lookahead around `pos`, with some reserve so
/// refills happen in large blocks. `pos` is the match-finder position and
/// `stream_pos` is how far the source has been read into the buffer; both
/// are logical stream offsets relative to `buf_offset`.
#[derive(Debug)]
pub struct InputWindow<R> {
    inner: R,
    buf: Vec<u8>,
    pos_limit: u32,
    last_safe_pos: u32,
    buf_offset: u32,
    block_size: u32,
    pos: u32,
    keep_size_before: u32,
    keep_size_after: u32,
    stream_pos: u32,
    stream_end: bool,
    total_read: u64,
}

impl<R: Read> InputWindow<R> {
    /// Creates the window and performs the initial refill.
    pub fn new(
        inner: R,
        keep_size_before: u32,
        keep_size_after: u32,
        reserve: u32,
    ) -> io::Result<Self> {
        let block_size = keep_size_before + keep_size_after + reserve;
        let mut iw = Self {
            inner,
            buf: vec![0u8; block_size as usize],
            pos_limit: 0,
            last_safe_pos: block_size - keep_size_after,
            buf_offset: 0,
            block_size,
            pos: 0,
            keep_size_before,
            keep_size_after,
            stream_pos: 0,
            stream_end: false,
            total_read: 0,
        };
        iw.read_block()?;
        Ok(iw)
    }

    /// Total bytes consumed from the source so far.
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Current match-finder position (logical offset).
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Logical end of buffered data.
    pub(crate) fn stream_pos(&self) -> u32 {
        self.stream_pos
    }

    /// Physical offset of logical position 0 in the raw buffer.
    pub(crate) fn buf_offset(&self) -> u32 {
        self.buf_offset
    }

    /// Raw backing buffer, for the match-finder inner loops.
    pub(crate) fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Compacts the buffer, dropping history older than the safe margin.
    ///
    /// `buf_offset` wraps modulo 2^32 after [`reduce_offsets`](Self::reduce_offsets);
    /// sums of `buf_offset` with a logical position always land back at a
    /// small physical index.
    fn move_block(&mut self) {
        let mut offset = self
            .buf_offset
            .wrapping_add(self.pos)
            .wrapping_sub(self.keep_size_before);
        // Keep one extra byte so byte_at(-1) of the oldest position stays valid.
        if offset > 0 {
            offset -= 1;
        }
        let num_bytes = self.buf_offset.wrapping_add(self.stream_pos) - offset;
        self.buf
            .copy_within(offset as usize..(offset + num_bytes) as usize, 0);
        self.buf_offset = self.buf_offset.wrapping_sub(offset);
    }

    /// Refills the buffer from the source until it is full or the source is
    /// exhausted. A zero-length read marks the clean end of the stream.
    fn read_block(&mut self) -> io::Result<()> {
        if self.stream_end {
            return Ok(());
        }
        loop {
            let start = self.buf_offset.wrapping_add(self.stream_pos) as usize;
            if start == self.block_size as usize {
                return Ok(());
            }
            let n = match self.inner.read(&mut self.buf[start..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.pos_limit = self.stream_pos;
                let ptr = self.buf_offset.wrapping_add(self.pos_limit);
                if ptr > self.last_safe_pos {
                    self.pos_limit = self.last_safe_pos.wrapping_sub(self.buf_offset);
                }
                self.stream_end = true;
                return Ok(());
            }
            self.total_read += n as u64;
            self.stream_pos += n as u32;
            if self.stream_pos >= self.pos + self.keep_size_after {
                self.pos_limit = self.stream_pos - self.keep_size_after;
            }
        }
    }

    /// Advances the window position by one byte, compacting and refilling
    /// when the safe zone is exhausted.
    pub fn move_pos(&mut self) -> io::Result<()> {
        self.pos += 1;
        if self.pos > self.pos_limit {
            if self.buf_offset.wrapping_add(self.pos) > self.last_safe_pos {
                self.move_block();
            }
            self.read_block()?;
        }
        Ok(())
    }

    /// Byte at the given signed offset from the current position.
    pub fn byte_at(&self, index: i32) -> u8 {
        let physical = self.buf_offset.wrapping_add(self.pos);
        self.buf[(i64::from(physical) + i64::from(index)) as usize]
    }

    /// Length of the match between the bytes starting at `pos + index` and
    /// the bytes `distance + 1` behind them, capped at `limit`. Compares
    /// directly in the buffer and stops at the first mismatch.
    pub fn match_len(&self, index: i32, distance: u32, mut limit: u32) -> u32 {
        let u_index = index as u32;
        if self.stream_end {
            let base = self.pos.wrapping_add(u_index);
            if base.wrapping_add(limit) > self.stream_pos {
                limit = self.stream_pos - base;
            }
        }
        let back = distance + 1;
        let pby = (self.buf_offset.wrapping_add(self.pos).wrapping_add(u_index)) as usize;
        let mut len = 0u32;
        while len < limit
            && self.buf[pby + len as usize] == self.buf[pby + len as usize - back as usize]
        {
            len += 1;
        }
        len
    }

    /// Bytes buffered ahead of the current position.
    pub fn available(&self) -> u32 {
        self.stream_pos - self.pos
    }

    /// Rebases all logical offsets by `sub_value` (match-finder normalize).
    pub fn reduce_offsets(&mut self, sub_value: u32) {
        self.buf_offset = self.buf_offset.wrapping_add(sub_value);
        self.pos_limit = self.pos_limit.wrapping_sub(sub_value);
        self.pos = self.pos.wrapping_sub(sub_value);
        self.stream_pos = self.stream_pos.wrapping_sub(sub_value);
    }
}

/// Decoder-side dictionary ring buffer.
///
/// Bytes accumulate in the ring; whenever the write position wraps, the
/// completed span is flushed to the sink. Back-references are materialized
/// by [`copy_block`](Self::copy_block).
#[derive(Debug)]
pub struct OutputWindow<W> {
    inner: W,
    buf: Vec<u8>,
    win_size: u32,
    pos: u32,
    stream_pos: u32,
    total_written: u64,
}

impl<W: Write> OutputWindow<W> {
    /// Creates a ring of `window_size` bytes writing through to `inner`.
    pub fn new(inner: W, window_size: u32) -> Self {
        Self {
            inner,
            buf: vec![0u8; window_size as usize],
            win_size: window_size,
            pos: 0,
            stream_pos: 0,
            total_written: 0,
        }
    }

    /// Total bytes pushed to the sink so far.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Writes the span completed since the last flush to the sink and wraps
    /// the ring pointer if it reached the end.
    pub fn flush(&mut self) -> io::Result<()> {
        let size = self.pos - self.stream_pos;
        if size == 0 {
            return Ok(());
        }
        self.inner
            .write_all(&self.buf[self.stream_pos as usize..(self.stream_pos + size) as usize])?;
        self.total_written += u64::from(size);
        if self.pos >= self.win_size {
            self.pos = 0;
        }
        self.stream_pos = self.pos;
        Ok(())
    }

    /// Copies `length` bytes from `distance + 1` back in the ring to the
    /// current position. The copy runs forward byte by byte, which is what
    /// makes overlapping references (`distance < length`) reproduce the
    /// repeated run correctly.
    pub fn copy_block(&mut self, distance: u32, length: u32) -> io::Result<()> {
        let mut src = self.pos.wrapping_sub(distance).wrapping_sub(1);
        if src >= self.win_size {
            src = src.wrapping_add(self.win_size);
        }
        for _ in 0..length {
            if src >= self.win_size {
                src = 0;
            }
            self.buf[self.pos as usize] = self.buf[src as usize];
            self.pos += 1;
            src += 1;
            if self.pos >= self.win_size {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Appends one literal byte.
    pub fn put_byte(&mut self, b: u8) -> io::Result<()> {
        self.buf[self.pos as usize] = b;
        self.pos += 1;
        if self.pos >= self.win_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Byte `distance + 1` positions behind the current write position.
    pub fn get_byte(&self, distance: u32) -> u8 {
        let mut pos = self.pos.wrapping_sub(distance).wrapping_sub(1);
        if pos >= self.win_size {
            pos = pos.wrapping_add(self.win_size);
        }
        self.buf[pos as usize]
    }
}
