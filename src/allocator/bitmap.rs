//! Bitmap blocks: one bit per disk block
//!
//! A bitmap block is the in-memory image of one on-disk block of the free
//! space bitmap. Bit `k` lives in little-endian word `k / 32` at bit `k % 32`:
//! - 0 = free block
//! - 1 = allocated block
//!
//! Bits at or past `num_bits` are never set by this type and are ignored by
//! every query.

/// Bits per bitmap word
pub const WORD_BITS: u32 = 32;

/// In-memory image of one bitmap block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapBlock {
    /// Bitmap words (each word = 32 blocks)
    words: Vec<u32>,

    /// Number of meaningful bits
    num_bits: u32,
}

impl BitmapBlock {
    /// Create an all-free bitmap block
    pub fn new(block_size: usize, num_bits: u32) -> Self {
        debug_assert!(num_bits as usize <= block_size * 8);
        BitmapBlock {
            words: vec![0u32; block_size / 4],
            num_bits,
        }
    }

    /// Decode an on-disk block; stray bits past `num_bits` are dropped
    pub fn from_bytes(bytes: &[u8], num_bits: u32) -> Self {
        let mut words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let full = (num_bits / WORD_BITS) as usize;
        let rem = num_bits % WORD_BITS;
        if full < words.len() {
            if rem > 0 {
                words[full] &= (1u32 << rem) - 1;
                words[full + 1..].iter_mut().for_each(|w| *w = 0);
            } else {
                words[full..].iter_mut().for_each(|w| *w = 0);
            }
        }

        BitmapBlock { words, num_bits }
    }

    /// Encode to the on-disk representation
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Number of words covering the meaningful bits
    pub fn num_words(&self) -> usize {
        self.num_bits.div_ceil(WORD_BITS) as usize
    }

    pub fn word(&self, index: usize) -> u32 {
        self.words[index]
    }

    /// Mask of the meaningful bits of word `index`
    pub fn word_mask(&self, index: usize) -> u32 {
        let start = index as u32 * WORD_BITS;
        if start + WORD_BITS <= self.num_bits {
            u32::MAX
        } else if start >= self.num_bits {
            0
        } else {
            (1u32 << (self.num_bits - start)) - 1
        }
    }

    /// Replace word `index`, keeping bits past `num_bits` clear
    pub fn set_word(&mut self, index: usize, value: u32) {
        self.words[index] = value & self.word_mask(index);
    }

    /// Check if a bit is set (allocated)
    pub fn is_set(&self, bit: u32) -> bool {
        if bit >= self.num_bits {
            return false;
        }
        (self.words[(bit / WORD_BITS) as usize] & (1u32 << (bit % WORD_BITS))) != 0
    }

    /// Set `len` bits starting at `start`
    pub fn set_range(&mut self, start: u32, len: u32) {
        self.apply_range(start, len, |word, mask| *word |= mask);
    }

    /// Clear `len` bits starting at `start`
    pub fn clear_range(&mut self, start: u32, len: u32) {
        self.apply_range(start, len, |word, mask| *word &= !mask);
    }

    /// Whether every bit in the range is clear
    pub fn is_range_clear(&self, start: u32, len: u32) -> bool {
        self.first_set_in_range(start, len).is_none()
    }

    /// Whether every bit in the range is set
    pub fn is_range_set(&self, start: u32, len: u32) -> bool {
        self.first_clear_in_range(start, len).is_none()
    }

    /// Lowest set bit in `[start, start + len)`
    pub fn first_set_in_range(&self, start: u32, len: u32) -> Option<u32> {
        self.find_in_range(start, len, |word| word)
    }

    /// Lowest clear bit in `[start, start + len)`
    pub fn first_clear_in_range(&self, start: u32, len: u32) -> Option<u32> {
        self.find_in_range(start, len, |word| !word)
    }

    /// Number of set bits
    pub fn count_set(&self) -> u32 {
        (0..self.num_words())
            .map(|i| (self.words[i] & self.word_mask(i)).count_ones())
            .sum()
    }

    fn range_end(&self, start: u32, len: u32) -> u32 {
        start.saturating_add(len).min(self.num_bits)
    }

    fn apply_range(&mut self, start: u32, len: u32, op: impl Fn(&mut u32, u32)) {
        let end = self.range_end(start, len);
        let mut bit = start;
        while bit < end {
            let offset = bit % WORD_BITS;
            let count = (WORD_BITS - offset).min(end - bit);
            let mask = if count == WORD_BITS {
                u32::MAX
            } else {
                ((1u32 << count) - 1) << offset
            };
            op(&mut self.words[(bit / WORD_BITS) as usize], mask);
            bit += count;
        }
    }

    fn find_in_range(&self, start: u32, len: u32, view: impl Fn(u32) -> u32) -> Option<u32> {
        let end = self.range_end(start, len);
        let mut bit = start;
        while bit < end {
            let index = (bit / WORD_BITS) as usize;
            let offset = bit % WORD_BITS;
            let count = (WORD_BITS - offset).min(end - bit);
            let mask = if count == WORD_BITS {
                u32::MAX
            } else {
                ((1u32 << count) - 1) << offset
            };
            let hits = view(self.words[index]) & mask;
            if hits != 0 {
                return Some(index as u32 * WORD_BITS + hits.trailing_zeros());
            }
            bit += count;
        }
        None
    }
}
