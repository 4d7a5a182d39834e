//! Concurrent Bitmap - Atomic Packed Bit Set
//!
//! Single-bit reads and writes, and whole-word reads, are atomic and may race
//! freely with each other. Multi-word range operations are not atomic as a
//! whole; callers must serialize them externally (the tracking lock).
//!
//! # Memory Ordering
//!
//! - Bit writes use `AcqRel` RMW operations so a dirty flag set by a signal
//!   handler is visible to a consumer that subsequently reads it.
//! - Reads use `Acquire`.

use super::{end_mask, start_mask, word_count, WORD_MASK, WORD_SHIFT};
use std::sync::atomic::{AtomicU64, Ordering};

/// ConcurrentBitmap - atomic packed bit set shared between dirty-flag owners
#[derive(Debug)]
pub struct ConcurrentBitmap {
    words: Vec<AtomicU64>,
    capacity: usize,
}

impl ConcurrentBitmap {
    /// Create a bitmap with every bit set to `initial`
    pub fn new(capacity: usize, initial: bool) -> Self {
        let words: Vec<AtomicU64> = (0..word_count(capacity))
            .map(|_| AtomicU64::new(0))
            .collect();

        let bitmap = Self { words, capacity };
        if initial && capacity > 0 {
            bitmap.set_range(0, capacity - 1);
        }
        bitmap
    }

    /// Number of addressable bits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if any bit is set
    pub fn any_set(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }

    /// Check if `bit` is set
    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        let mask = 1u64 << (bit & WORD_MASK);
        self.words[bit >> WORD_SHIFT].load(Ordering::Acquire) & mask != 0
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
            return self.word(start_word) & start_mask(start) & end_mask(end) != 0;
        }

        if self.word(start_word) & start_mask(start) != 0 {
            return true;
        }

        if (start_word + 1..end_word).any(|i| self.word(i) != 0) {
            return true;
        }

        self.word(end_word) & end_mask(end) != 0
    }

    /// Set `bit`
    #[inline]
    pub fn set(&self, bit: usize) {
        self.set_to(bit, true);
    }

    /// Set or clear `bit` atomically, returning its previous value
    #[inline]
    pub fn set_to(&self, bit: usize, value: bool) -> bool {
        let word = &self.words[bit >> WORD_SHIFT];
        let mask = 1u64 << (bit & WORD_MASK);

        let previous = if value {
            word.fetch_or(mask, Ordering::AcqRel)
        } else {
            word.fetch_and(!mask, Ordering::AcqRel)
        };
        previous & mask != 0
    }

    /// Set every bit in `[start, end]`
    ///
    /// Each word is updated atomically but the range as a whole is not.
    pub fn set_range(&self, start: usize, end: usize) {
        debug_assert!(start <= end);

        if start == end {
            self.set(start);
            return;
        }

        let start_word = start >> WORD_SHIFT;
        let end_word = end >> WORD_SHIFT;

        if start_word == end_word {
            self.words[start_word].fetch_or(start_mask(start) & end_mask(end), Ordering::AcqRel);
            return;
        }

        self.words[start_word].fetch_or(start_mask(start), Ordering::AcqRel);
        for word in &self.words[start_word + 1..end_word] {
            word.store(u64::MAX, Ordering::Release);
        }
        self.words[end_word].fetch_or(end_mask(end), Ordering::AcqRel);
    }

    /// Clear `bit`
    #[inline]
    pub fn clear(&self, bit: usize) {
        self.set_to(bit, false);
    }

    /// Clear every bit
    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// Atomic snapshot of the word at `index`
    #[inline]
    pub fn word(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Acquire)
    }

    /// Number of backing words
    pub fn word_len(&self) -> usize {
        self.words.len()
    }
}
