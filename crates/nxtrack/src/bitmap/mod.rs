//! Bit Vectors - Packed Dirty Flags
//!
//! Fixed-capacity sets of booleans packed into 64-bit words. Bit `i` lives in
//! word `i >> 6`, bit `i & 63`.
//!
//! Two flavours are provided:
//! - [`Bitmap`]: plain words, for single-threaded bookkeeping.
//! - [`ConcurrentBitmap`]: atomic words, shared between handles that each own
//!   one bit.
//!
//! Layout:
//! ```text
//! bit index:   0 ........ 63 | 64 ....... 127 | 128 ...
//! word:        [    word 0   ] [    word 1    ] [ word 2 ...
//! ```
//!
//! Range operations take an inclusive `[start, end]` pair.

mod concurrent;

pub use concurrent::ConcurrentBitmap;

/// Number of bits per word
pub const WORD_BITS: usize = 64;

/// Shift converting a bit index to a word index
pub const WORD_SHIFT: usize = 6;

/// Mask extracting the bit offset inside a word
pub const WORD_MASK: usize = WORD_BITS - 1;

/// Number of words needed for `capacity` bits
#[inline]
pub(crate) fn word_count(capacity: usize) -> usize {
    capacity.div_ceil(WORD_BITS)
}

/// Mask of the bits at or above `start` within its word
#[inline]
pub(crate) fn start_mask(start: usize) -> u64 {
    u64::MAX << (start & WORD_MASK)
}

/// Mask of the bits at or below `end` within its word
#[inline]
pub(crate) fn end_mask(end: usize) -> u64 {
    u64::MAX >> (WORD_MASK - (end & WORD_MASK))
}

/// Bitmap - single-threaded packed bit set
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl Bitmap {
    /// Create a bitmap with every bit clear
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; word_count(capacity)],
            capacity,
        }
    }

    /// Number of addressable bits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if any bit is set
    pub fn any_set(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Check if `bit` is set
    pub fn is_set(&self, bit: usize) -> bool {
        let mask = 1u64 << (bit & WORD_MASK);
        self.words[bit >> WORD_SHIFT] & mask != 0
    }

    /// Check if at least one bit in `[start, end]` is set
    pub fn is_set_in_range(&self, start: usize, end: usize) -> bool {
        debug_assert!(start <= end);

        if start == end {
            return self.is_set(start);
        }

        let start_word = start >> WORD_SHIFT;
        let end_word = end >> WORD_SHIFT;

        if start_word == end_word {
            return self.words[start_word] & start_mask(start) & end_mask(end) != 0;
        }

        if self.words[start_word] & start_mask(start) != 0 {
            return true;
        }

        if self.words[start_word + 1..end_word].iter().any(|&w| w != 0) {
            return true;
        }

        self.words[end_word] & end_mask(end) != 0
    }

    /// Set `bit`, returning `true` if it was previously clear
    pub fn set(&mut self, bit: usize) -> bool {
        let word = &mut self.words[bit >> WORD_SHIFT];
        let mask = 1u64 << (bit & WORD_MASK);

        if *word & mask != 0 {
            return false;
        }

        *word |= mask;
        true
    }

    /// Set or clear `bit`
    pub fn set_to(&mut self, bit: usize, value: bool) {
        if value {
            self.set(bit);
        } else {
            self.clear(bit);
        }
    }

    /// Set every bit in `[start, end]`
    pub fn set_range(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end);

        if start == end {
            self.set(start);
            return;
        }

        let start_word = start >> WORD_SHIFT;
        let end_word = end >> WORD_SHIFT;

        if start_word == end_word {
            self.words[start_word] |= start_mask(start) & end_mask(end);
            return;
        }

        self.words[start_word] |= start_mask(start);
        for word in &mut self.words[start_word + 1..end_word] {
            *word = u64::MAX;
        }
        self.words[end_word] |= end_mask(end);
    }

    /// Clear `bit`, returning `true` if it was previously set
    pub fn clear(&mut self, bit: usize) -> bool {
        let word = &mut self.words[bit >> WORD_SHIFT];
        let mask = 1u64 << (bit & WORD_MASK);
        let was_set = *word & mask != 0;

        *word &= !mask;
        was_set
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Raw word at `index`
    #[inline]
    pub fn word(&self, index: usize) -> u64 {
        self.words[index]
    }

    /// Mutable raw word at `index`, for word-at-a-time bookkeeping
    #[inline]
    pub fn word_mut(&mut self, index: usize) -> &mut u64 {
        &mut self.words[index]
    }

    /// Number of backing words
    pub fn word_len(&self) -> usize {
        self.words.len()
    }
}
