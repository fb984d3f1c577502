//! Visited bits for region objects, one bit per two words. An object is at
//! least a pre-header and a mark word, so no two objects share a bit.

use crate::area::SbaArea;

pub struct MarkBits {
    base: usize,
    bits: Vec<u64>,
}

impl MarkBits {
    /// Bits covering the live part of `area`.
    pub fn new(area: &SbaArea) -> MarkBits {
        let n = (area.used() / 2 + 64) / 64;
        MarkBits {
            base: area.start(),
            bits: vec![0; n],
        }
    }

    #[inline(always)]
    fn index(&self, obj: usize) -> (usize, u64) {
        debug_assert!(obj >= self.base);
        let bit = (obj - self.base) >> 1;
        (bit / 64, 1 << (bit % 64))
    }

    #[inline(always)]
    pub fn test(&self, obj: usize) -> bool {
        let (word, mask) = self.index(obj);
        self.bits.get(word).map_or(false, |w| w & mask != 0)
    }

    /// Set the bit, returning whether it was already set.
    #[inline(always)]
    pub fn test_set(&mut self, obj: usize) -> bool {
        let (word, mask) = self.index(obj);
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let was = self.bits[word] & mask != 0;
        self.bits[word] |= mask;
        was
    }

    /// Clear the bit, returning whether it was set.
    #[inline(always)]
    pub fn test_clr(&mut self, obj: usize) -> bool {
        let (word, mask) = self.index(obj);
        match self.bits.get_mut(word) {
            Some(w) => {
                let was = *w & mask != 0;
                *w &= !mask;
                was
            }
            None => false,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SbaConfig;

    #[test]
    fn test_set_and_clear() {
        let area = SbaArea::new(&SbaConfig::default());
        let mut marks = MarkBits::new(&area);
        assert!(!marks.test(1));
        assert!(!marks.test_set(1));
        assert!(marks.test_set(1));
        assert!(marks.test(1));
        assert!(!marks.test(4));
        // Beyond the initial size.
        assert!(!marks.test_set(10_001));
        assert!(marks.test(10_001));
        assert!(marks.test_clr(1));
        assert!(!marks.test_clr(1));
        assert!(marks.test_clr(10_001));
        assert!(marks.is_clear());
    }
}
