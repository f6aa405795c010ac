use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length array of bits, one per slot of some resource.
///
/// Used by the swap allocator to track which page-sized slots of the swap
/// device hold evicted data.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap with `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of bit `idx`.
    ///
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of bounds (len {})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    /// Sets bit `idx` to `value`.
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of bounds (len {})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Returns the index of the first bit at or after `start` equal to
    /// `value`.
    pub fn scan(&self, start: usize, value: bool) -> Option<usize> {
        let mut idx = start;
        while idx < self.len {
            let word = self.words[idx / WORD_BITS];
            // Flip the word so the bits we are looking for read as ones.
            let candidates = (if value { word } else { !word }) >> (idx % WORD_BITS);
            if candidates == 0 {
                idx = (idx / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let found = idx + candidates.trailing_zeros() as usize;
            return (found < self.len).then_some(found);
        }
        None
    }

    /// Finds the first bit equal to `value`, flips it and returns its index.
    pub fn scan_and_flip(&mut self, start: usize, value: bool) -> Option<usize> {
        let idx = self.scan(start, value)?;
        self.set(idx, !value);
        Some(idx)
    }

    /// Number of bits set to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones = self
            .words
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum::<usize>();
        if value {
            ones
        } else {
            self.len - ones
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut bitmap = Bitmap::new(130);
        assert_eq!(bitmap.count(true), 0);
        bitmap.set(0, true);
        bitmap.set(64, true);
        bitmap.set(129, true);
        assert!(bitmap.get(0));
        assert!(!bitmap.get(1));
        assert!(bitmap.get(64));
        assert!(bitmap.get(129));
        assert_eq!(bitmap.count(true), 3);
        assert_eq!(bitmap.count(false), 127);

        bitmap.set(64, false);
        assert!(!bitmap.get(64));
    }

    #[test]
    fn scan_skips_full_words() {
        let mut bitmap = Bitmap::new(100);
        for i in 0..70 {
            bitmap.set(i, true);
        }
        assert_eq!(bitmap.scan(0, false), Some(70));
        assert_eq!(bitmap.scan(0, true), Some(0));
        assert_eq!(bitmap.scan(70, true), None);
    }

    #[test]
    fn scan_does_not_run_past_len() {
        let mut bitmap = Bitmap::new(3);
        bitmap.set(0, true);
        bitmap.set(1, true);
        bitmap.set(2, true);
        // The unused tail of the last word is clear but not part of the map.
        assert_eq!(bitmap.scan(0, false), None);
    }

    #[test]
    fn scan_and_flip_exhausts() {
        let mut bitmap = Bitmap::new(2);
        assert_eq!(bitmap.scan_and_flip(0, false), Some(0));
        assert_eq!(bitmap.scan_and_flip(0, false), Some(1));
        assert_eq!(bitmap.scan_and_flip(0, false), None);
        bitmap.set(0, false);
        assert_eq!(bitmap.scan_and_flip(0, false), Some(0));
    }

    #[test]
    fn empty_bitmap() {
        let mut bitmap = Bitmap::new(0);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.scan_and_flip(0, false), None);
    }
}
