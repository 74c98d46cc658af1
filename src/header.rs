//! Stream header and encoder presets.
//!
//! A stream starts with a 13-byte header: one packed properties byte
//! (`(pb * 5 + lp) * 9 + lc`), the dictionary size as 4 little-endian
//! bytes, and the uncompressed size as 8 little-endian bytes of a signed
//! 64-bit value, where `-1` means the size is unknown and the stream ends
//! with an explicit end marker.

use std::io::{Read, Write};

use crate::constants::HEADER_SIZE;
use crate::error::{Error, Result};

/// Which match-finder variant the encoder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchFinder {
    /// 2-byte direct hash. Faster, weaker matches.
    Bt2,
    /// 4-byte CRC hash with 2/3-byte side tables.
    #[default]
    Bt4,
}

impl MatchFinder {
    pub(crate) fn num_hash_bytes(self) -> u32 {
        match self {
            Self::Bt2 => 2,
            Self::Bt4 => 4,
        }
    }
}

/// The decoded model parameters carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    /// Literal context bits (0..=8).
    pub lc: u32,
    /// Literal position bits (0..=4).
    pub lp: u32,
    /// Position bits (0..=4).
    pub pb: u32,
    /// Dictionary size in bytes.
    pub dict_size: u32,
}

impl Properties {
    /// Packs lc/lp/pb into the single properties byte.
    pub fn props_byte(&self) -> u8 {
        ((self.pb * 5 + self.lp) * 9 + self.lc) as u8
    }

    /// Unpacks a properties byte; values 225 and above cannot be produced
    /// by any valid lc/lp/pb combination.
    pub fn from_props_byte(b: u8, dict_size: u32) -> Result<Self> {
        let mut v = u32::from(b);
        if v >= 9 * 5 * 5 {
            return Err(Error::Header(format!("invalid properties byte: {b}")));
        }
        let lc = v % 9;
        v /= 9;
        let lp = v % 5;
        let pb = v / 5;
        Ok(Self {
            lc,
            lp,
            pb,
            dict_size,
        })
    }

    /// Writes the 13-byte header.
    pub fn write_header<W: Write>(&self, w: &mut W, size: i64) -> std::io::Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = self.props_byte();
        header[1..5].copy_from_slice(&self.dict_size.to_le_bytes());
        header[5..13].copy_from_slice(&size.to_le_bytes());
        w.write_all(&header)
    }

    /// Reads and validates the 13-byte header, returning the properties and
    /// the declared uncompressed size (`-1` for unknown).
    pub fn read_header<R: Read>(r: &mut R) -> Result<(Self, i64)> {
        let mut header = [0u8; HEADER_SIZE];
        r.read_exact(&mut header).map_err(|e| Error::read(0, e))?;
        let dict_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let props = Self::from_props_byte(header[0], dict_size)?;
        let size = i64::from_le_bytes([
            header[5], header[6], header[7], header[8], header[9], header[10], header[11],
            header[12],
        ]);
        if size < -1 {
            return Err(Error::Header(format!("invalid uncompressed size: {size}")));
        }
        Ok((props, size))
    }
}

/// Per-level tuning table, indexed by `level - 1`.
const LEVEL_DICT_SIZE_LOG2: [u32; 9] = [16, 18, 20, 22, 23, 24, 25, 26, 27];
const LEVEL_FAST_BYTES: [u32; 9] = [64, 64, 64, 128, 128, 128, 256, 256, 256];

/// Encoder tuning knobs.
///
/// [`EncoderOptions::from_level`] gives the standard presets; individual
/// fields can be overridden before constructing the encoder, and
/// [`validate`](Self::validate) is re-checked at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOptions {
    /// Dictionary size as a power of two (12..=29).
    pub dict_size_log2: u32,
    /// Upper bound on "good enough" match lengths (5..=273).
    pub fast_bytes: u32,
    /// Literal context bits.
    pub lc: u32,
    /// Literal position bits.
    pub lp: u32,
    /// Position bits.
    pub pb: u32,
    /// Match finder variant.
    pub match_finder: MatchFinder,
}

impl EncoderOptions {
    /// The preset for a compression level in 1..=9.
    pub fn from_level(level: u32) -> Result<Self> {
        if !(1..=9).contains(&level) {
            return Err(Error::InvalidArgument {
                msg: "compression level out of range",
                value: i64::from(level),
            });
        }
        let i = (level - 1) as usize;
        Ok(Self {
            dict_size_log2: LEVEL_DICT_SIZE_LOG2[i],
            fast_bytes: LEVEL_FAST_BYTES[i],
            lc: 3,
            lp: 0,
            pb: 2,
            match_finder: MatchFinder::Bt4,
        })
    }

    /// Checks every field against its legal range.
    pub fn validate(&self) -> Result<()> {
        if !(12..=29).contains(&self.dict_size_log2) {
            return Err(Error::InvalidArgument {
                msg: "dictionary size log2 out of range",
                value: i64::from(self.dict_size_log2),
            });
        }
        if !(5..=273).contains(&self.fast_bytes) {
            return Err(Error::InvalidArgument {
                msg: "fast bytes out of range",
                value: i64::from(self.fast_bytes),
            });
        }
        if self.lc > 8 {
            return Err(Error::InvalidArgument {
                msg: "literal context bits out of range",
                value: i64::from(self.lc),
            });
        }
        if self.lp > 4 {
            return Err(Error::InvalidArgument {
                msg: "literal position bits out of range",
                value: i64::from(self.lp),
            });
        }
        if self.pb > 4 {
            return Err(Error::InvalidArgument {
                msg: "position bits out of range",
                value: i64::from(self.pb),
            });
        }
        Ok(())
    }

    pub(crate) fn dict_size(&self) -> u32 {
        1 << self.dict_size_log2
    }

    pub(crate) fn properties(&self) -> Properties {
        Properties {
            lc: self.lc,
            lp: self.lp,
            pb: self.pb,
            dict_size: self.dict_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_props_byte_packing() {
        let p = Properties {
            lc: 3,
            lp: 0,
            pb: 2,
            dict_size: 1 << 20,
        };
        assert_eq!(p.props_byte(), 0x5D);
        let q = Properties::from_props_byte(0x5D, 1 << 20).unwrap();
        assert_eq!(q, p);
    }

    #[test]
    fn test_props_byte_all_valid_values_roundtrip() {
        for b in 0..225u8 {
            let p = Properties::from_props_byte(b, 0).unwrap();
            assert_eq!(p.props_byte(), b);
            assert!(p.lc <= 8 && p.lp <= 4 && p.pb <= 4);
        }
    }

    #[test]
    fn test_props_byte_rejects_out_of_range() {
        for b in 225..=255u8 {
            assert!(matches!(
                Properties::from_props_byte(b, 0),
                Err(Error::Header(_))
            ));
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let p = Properties {
            lc: 3,
            lp: 0,
            pb: 2,
            dict_size: 1 << 20,
        };
        let mut buf = Vec::new();
        p.write_header(&mut buf, 123_456).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let (q, size) = Properties::read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(q, p);
        assert_eq!(size, 123_456);
    }

    #[test]
    fn test_header_unknown_size() {
        let p = Properties {
            lc: 0,
            lp: 0,
            pb: 0,
            dict_size: 4096,
        };
        let mut buf = Vec::new();
        p.write_header(&mut buf, -1).unwrap();
        assert_eq!(&buf[5..13], &[0xFF; 8]);
        let (_, size) = Properties::read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(size, -1);
    }

    #[test]
    fn test_header_rejects_negative_size_below_minus_one() {
        let mut buf = vec![0x5D];
        buf.extend_from_slice(&(1u32 << 16).to_le_bytes());
        buf.extend_from_slice(&(-2i64).to_le_bytes());
        assert!(matches!(
            Properties::read_header(&mut Cursor::new(buf)),
            Err(Error::Header(_))
        ));
    }

    #[test]
    fn test_level_presets() {
        let o1 = EncoderOptions::from_level(1).unwrap();
        assert_eq!(o1.dict_size_log2, 16);
        assert_eq!(o1.fast_bytes, 64);
        let o9 = EncoderOptions::from_level(9).unwrap();
        assert_eq!(o9.dict_size_log2, 27);
        assert_eq!(o9.fast_bytes, 256);
        assert!(EncoderOptions::from_level(0).is_err());
        assert!(EncoderOptions::from_level(10).is_err());
        for level in 1..=9 {
            EncoderOptions::from_level(level).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_bad_overrides() {
        let mut o = EncoderOptions::from_level(5).unwrap();
        o.fast_bytes = 4;
        assert!(o.validate().is_err());
        o.fast_bytes = 274;
        assert!(o.validate().is_err());
        let mut o = EncoderOptions::from_level(5).unwrap();
        o.dict_size_log2 = 30;
        assert!(o.validate().is_err());
        let mut o = EncoderOptions::from_level(5).unwrap();
        o.lc = 9;
        assert!(o.validate().is_err());
    }
}
