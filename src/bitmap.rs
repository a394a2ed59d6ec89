//! # Bitmap Primitives
//!
//! The packed bit array inside a bitmap group extent, and the on-disk header
//! that fronts it.
//!
//! ## On-Disk Layout
//!
//! ```text
//! Offset  Size        Description
//! ------  ----------  ----------------------------------------
//! 0       4           group_no
//! 4       4           total_cnt: number of valid bits
//! 8       4           free_cnt: total_cnt - popcount(bits)
//! 12      4           current_position: rotating search cursor
//! 16      1008        reserved (header region is 1024 bytes)
//! 1024    ...         packed bit array, little-endian u32 words
//! ```
//!
//! ## Bit Numbering
//!
//! The array is addressed as little-endian 32-bit words with LSB-first bit
//! order inside each word, so bit `i` lives in word `i / 32` at position
//! `i % 32`. Endian conversion happens only here, at the byte boundary;
//! callers see plain bit indices.
//!
//! ## Tail Masking
//!
//! The last word may extend past `total_cnt`. Those padding bits are masked
//! out of every search and count: a clear padding bit is never reported as
//! free, and a set padding bit never inflates the population count.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{FsError, Result};

/// Bytes of the populated part of the group header.
pub const GROUP_HEADER_SIZE: usize = 16;

const BITS_PER_WORD: u32 = 32;
const BYTES_PER_WORD: usize = 4;

/// On-disk header of one bitmap group.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct GroupHeader {
    group_no: U32,
    total_cnt: U32,
    free_cnt: U32,
    current_position: U32,
}

const _: () = assert!(std::mem::size_of::<GroupHeader>() == GROUP_HEADER_SIZE);

impl GroupHeader {
    /// Header of a freshly formatted group: every bit clear, cursor at 0.
    #[must_use]
    pub fn new(group_no: u32, total_cnt: u32) -> Self {
        Self {
            group_no: U32::new(group_no),
            total_cnt: U32::new(total_cnt),
            free_cnt: U32::new(total_cnt),
            current_position: U32::new(0),
        }
    }

    pub fn ref_from_prefix(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < GROUP_HEADER_SIZE {
            return Err(FsError::Format(format!(
                "buffer too small for group header: {} < {GROUP_HEADER_SIZE}",
                bytes.len()
            )));
        }
        Self::ref_from_bytes(&bytes[..GROUP_HEADER_SIZE])
            .map_err(|_| FsError::Format("group header conversion failed".into()))
    }

    pub fn mut_from_prefix(bytes: &mut [u8]) -> Result<&mut Self> {
        if bytes.len() < GROUP_HEADER_SIZE {
            return Err(FsError::Format(format!(
                "buffer too small for group header: {} < {GROUP_HEADER_SIZE}",
                bytes.len()
            )));
        }
        Self::mut_from_bytes(&mut bytes[..GROUP_HEADER_SIZE])
            .map_err(|_| FsError::Format("group header conversion failed".into()))
    }

    pub fn group_no(&self) -> u32 {
        self.group_no.get()
    }

    pub fn total_cnt(&self) -> u32 {
        self.total_cnt.get()
    }

    pub fn free_cnt(&self) -> u32 {
        self.free_cnt.get()
    }

    pub fn current_position(&self) -> u32 {
        self.current_position.get()
    }

    pub fn set_free_cnt(&mut self, v: u32) {
        self.free_cnt = U32::new(v);
    }

    pub fn set_current_position(&mut self, v: u32) {
        self.current_position = U32::new(v);
    }
}

/// A bit array borrowed from a buffer, `nbits` valid bits long.
pub struct Bitmap<'a> {
    bytes: &'a mut [u8],
    nbits: u32,
}

impl<'a> Bitmap<'a> {
    /// Wrap `bytes` as a bitmap of `nbits` bits. The slice must cover every
    /// word the bit range touches.
    pub fn new(bytes: &'a mut [u8], nbits: u32) -> Result<Self> {
        let words = nbits.div_ceil(BITS_PER_WORD) as usize;
        if bytes.len() < words * BYTES_PER_WORD {
            return Err(FsError::InvalidArgument(format!(
                "bitmap slice too small: {} bytes for {nbits} bits",
                bytes.len()
            )));
        }
        Ok(Self { bytes, nbits })
    }

    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    fn word_len(&self) -> usize {
        self.nbits.div_ceil(BITS_PER_WORD) as usize
    }

    fn word(&self, idx: usize) -> u32 {
        let off = idx * BYTES_PER_WORD;
        let raw: [u8; 4] = self.bytes[off..off + BYTES_PER_WORD]
            .try_into()
            .unwrap_or([0; 4]);
        u32::from_le_bytes(raw)
    }

    fn set_word(&mut self, idx: usize, value: u32) {
        let off = idx * BYTES_PER_WORD;
        self.bytes[off..off + BYTES_PER_WORD].copy_from_slice(&value.to_le_bytes());
    }

    fn check_range(&self, bit: u32) -> Result<()> {
        if bit >= self.nbits {
            return Err(FsError::InvalidArgument(format!(
                "bit {bit} out of range (total {})",
                self.nbits
            )));
        }
        Ok(())
    }

    pub fn test(&self, bit: u32) -> Result<bool> {
        self.check_range(bit)?;
        let word = self.word((bit / BITS_PER_WORD) as usize);
        Ok(word & (1 << (bit % BITS_PER_WORD)) != 0)
    }

    /// Set a bit, returning whether it was previously set.
    pub fn set(&mut self, bit: u32) -> Result<bool> {
        self.check_range(bit)?;
        let idx = (bit / BITS_PER_WORD) as usize;
        let mask = 1u32 << (bit % BITS_PER_WORD);
        let word = self.word(idx);
        self.set_word(idx, word | mask);
        Ok(word & mask != 0)
    }

    /// Clear a bit, returning whether it was previously set (a real 1→0
    /// transition).
    pub fn clear(&mut self, bit: u32) -> Result<bool> {
        self.check_range(bit)?;
        let idx = (bit / BITS_PER_WORD) as usize;
        let mask = 1u32 << (bit % BITS_PER_WORD);
        let word = self.word(idx);
        self.set_word(idx, word & !mask);
        Ok(word & mask != 0)
    }

    /// First clear bit strictly after `pos` (from 0 when `pos` is `None`).
    /// Padding bits past `nbits` are never reported.
    pub fn next_clear_bit_after(&self, pos: Option<u32>) -> Option<u32> {
        self.scan_after(pos, |w| !w)
    }

    /// First set bit strictly after `pos` (from 0 when `pos` is `None`).
    pub fn next_set_bit_after(&self, pos: Option<u32>) -> Option<u32> {
        self.scan_after(pos, |w| w)
    }

    fn scan_after(&self, pos: Option<u32>, transform: impl Fn(u32) -> u32) -> Option<u32> {
        let start = match pos {
            None => 0,
            Some(p) => p.checked_add(1)?,
        };
        if start >= self.nbits {
            return None;
        }

        let words = self.word_len();
        let mut wi = (start / BITS_PER_WORD) as usize;
        let low_mask = !((1u32 << (start % BITS_PER_WORD)) - 1);
        let mut bits = transform(self.word(wi)) & low_mask;

        while bits == 0 && wi + 1 < words {
            wi += 1;
            bits = transform(self.word(wi));
        }

        if wi == words - 1 {
            let tail = self.nbits % BITS_PER_WORD;
            if tail != 0 {
                bits &= (1u32 << tail) - 1;
            }
        }

        if bits == 0 {
            return None;
        }
        let found = wi as u32 * BITS_PER_WORD + bits.trailing_zeros();
        debug_assert!(found < self.nbits);
        Some(found)
    }

    /// Population count restricted to the first `nbits` bits.
    pub fn count_set(&self) -> u32 {
        let words = self.word_len();
        if words == 0 {
            return 0;
        }

        let mut total = 0;
        for wi in 0..words {
            let mut w = self.word(wi);
            if wi == words - 1 {
                let tail = self.nbits % BITS_PER_WORD;
                if tail != 0 {
                    w &= (1u32 << tail) - 1;
                }
            }
            total += w.count_ones();
        }
        total
    }
}
