use alloc::boxed::Box;
use alloc::vec;

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length bitmap. Bits start out clear.
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
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

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({} bits)", self.len);
        (self.words[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({} bits)", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    pub fn set_all(&mut self, value: bool) {
        self.words.fill(if value { u64::MAX } else { 0 });
        if value {
            self.clear_tail();
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Finds the first bit equal to `value`, flips it and returns its index.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let skip = if value { 0 } else { u64::MAX };
        let (word_idx, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, &word)| word != skip)?;
        let bit = if value {
            word.trailing_zeros()
        } else {
            word.trailing_ones()
        };
        let idx = word_idx * WORD_BITS + bit as usize;
        if idx >= self.len {
            return None;
        }
        self.set(idx, !value);
        Some(idx)
    }

    fn clear_tail(&mut self) {
        let used = self.len % WORD_BITS;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << used) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_first_clear_bit() {
        let mut bitmap = Bitmap::new(70);
        assert_eq!(bitmap.scan_and_flip(false), Some(0));
        assert_eq!(bitmap.scan_and_flip(false), Some(1));
        bitmap.set(0, false);
        assert_eq!(bitmap.scan_and_flip(false), Some(0));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn scan_crosses_word_boundary() {
        let mut bitmap = Bitmap::new(70);
        for i in 0..64 {
            bitmap.set(i, true);
        }
        assert_eq!(bitmap.scan_and_flip(false), Some(64));
        assert!(bitmap.test(64));
    }

    #[test]
    fn scan_respects_length() {
        let mut bitmap = Bitmap::new(3);
        bitmap.set_all(true);
        assert_eq!(bitmap.count_ones(), 3);
        assert_eq!(bitmap.scan_and_flip(false), None);
        bitmap.set(2, false);
        assert_eq!(bitmap.scan_and_flip(false), Some(2));
        assert_eq!(bitmap.scan_and_flip(false), None);
    }

    #[test]
    fn empty_bitmap_has_nothing_to_scan() {
        let mut bitmap = Bitmap::new(0);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.scan_and_flip(false), None);
    }
}
