use crate::core::{mem, ptr::NonNull};

/// The number of bits in one bitmap word.
const BITS: usize = usize::BITS as usize;

/// A bitmap stored in words outside of the level descriptor.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<usize>,
}

impl Bitmap {
    /// Returns the number of words needed to store `num_bits` bits.
    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits / BITS + (num_bits % BITS != 0) as usize
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are cleared.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Self::num_words(num_bits)` words, and it must be properly aligned.
    /// - No other `Bitmap` may refer to any of those words.
    pub unsafe fn new(num_bits: usize, map: NonNull<usize>) -> Bitmap {
        assert!(num_bits > 0);
        assert_eq!(map.as_ptr().align_offset(mem::align_of::<usize>()), 0);

        for i in 0..Self::num_words(num_bits) {
            unsafe { map.as_ptr().add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    /// Returns a mutable reference to the word containing `bit`, and the
    /// offset of `bit` within it.
    #[inline]
    fn locate_mut(&mut self, bit: usize) -> (&mut usize, usize) {
        assert!(bit < self.num_bits, "bit {bit} out of range");

        let (word, offset) = locate(bit);

        // SAFETY: `word` is less than `num_words(num_bits)`, which the map
        // was guaranteed to hold on construction, and `&mut self` guarantees
        // exclusive access.
        (unsafe { &mut *self.map.as_ptr().add(word) }, offset)
    }

    #[inline]
    fn word(&self, bit: usize) -> (usize, usize) {
        assert!(bit < self.num_bits, "bit {bit} out of range");

        let (word, offset) = locate(bit);

        // SAFETY: see `locate_mut`.
        (unsafe { self.map.as_ptr().add(word).read() }, offset)
    }
}

/// Returns the index of the word containing `bit` and the bit's offset
/// within that word.
#[inline]
pub const fn locate(bit: usize) -> (usize, usize) {
    (bit / BITS, bit % BITS)
}

/// The allocation bits of one pool level.
///
/// Levels with no more blocks than there are bits in a word keep their bits
/// inline; larger levels refer to words in the pool's metadata region. Both
/// forms are addressed identically.
pub enum LevelBits {
    Inline { num_bits: usize, word: usize },
    External(Bitmap),
}

impl LevelBits {
    /// Returns whether `num_bits` bits fit inline.
    #[inline]
    pub const fn fits_inline(num_bits: usize) -> bool {
        num_bits <= BITS
    }

    /// Returns the number of external words required for `num_bits` bits.
    #[inline]
    pub const fn external_words(num_bits: usize) -> usize {
        if Self::fits_inline(num_bits) {
            0
        } else {
            Bitmap::num_words(num_bits)
        }
    }

    /// Creates a cleared inline bitmap.
    #[inline]
    pub fn inline(num_bits: usize) -> LevelBits {
        assert!(Self::fits_inline(num_bits));
        LevelBits::Inline { num_bits, word: 0 }
    }

    #[inline]
    fn locate_mut(&mut self, bit: usize) -> (&mut usize, usize) {
        match self {
            LevelBits::Inline { num_bits, word } => {
                assert!(bit < *num_bits, "bit {bit} out of range");
                (word, bit)
            }
            LevelBits::External(bitmap) => bitmap.locate_mut(bit),
        }
    }

    #[inline]
    fn word(&self, bit: usize) -> (usize, usize) {
        match self {
            LevelBits::Inline { num_bits, word } => {
                assert!(bit < *num_bits, "bit {bit} out of range");
                (*word, bit)
            }
            LevelBits::External(bitmap) => bitmap.word(bit),
        }
    }

    /// Returns the value of the indexed bit.
    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        let (word, offset) = self.word(bit);
        word & (1 << offset) != 0
    }

    /// Sets the indexed bit.
    #[inline]
    pub fn set(&mut self, bit: usize) {
        let (word, offset) = self.locate_mut(bit);
        *word |= 1 << offset;
    }

    /// Clears the indexed bit.
    #[inline]
    pub fn clear(&mut self, bit: usize) {
        let (word, offset) = self.locate_mut(bit);
        *word &= !(1 << offset);
    }

    /// Returns the four bits covering the sibling group of `bit`.
    ///
    /// Sibling groups are aligned to four bits, so they never straddle a word.
    #[inline]
    pub fn partner_nibble(&self, bit: usize) -> u8 {
        let (word, offset) = self.word(bit);
        ((word >> (offset & !3)) & 0xf) as u8
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    pub fn count_set(&self) -> usize {
        match self {
            LevelBits::Inline { word, .. } => word.count_ones() as usize,
            LevelBits::External(bitmap) => (0..Bitmap::num_words(bitmap.num_bits))
                .map(|w| {
                    // SAFETY: see `Bitmap::locate_mut`.
                    let word = unsafe { bitmap.map.as_ptr().add(w).read() };
                    word.count_ones() as usize
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    struct VecBits {
        bits: LevelBits,
        _words: Vec<usize>,
    }

    impl VecBits {
        fn external(num_bits: usize) -> VecBits {
            let mut words = vec![usize::MAX; Bitmap::num_words(num_bits)];
            let map = NonNull::new(words.as_mut_ptr()).unwrap();
            let bits = LevelBits::External(unsafe { Bitmap::new(num_bits, map) });

            VecBits {
                bits,
                _words: words,
            }
        }
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let b = VecBits::external(num_bits);
            assert_eq!(b.bits.count_set(), 0);
        }
    }

    #[test]
    fn word_counts() {
        assert_eq!(Bitmap::num_words(1), 1);
        assert_eq!(Bitmap::num_words(BITS), 1);
        assert_eq!(Bitmap::num_words(BITS + 1), 2);
        assert_eq!(LevelBits::external_words(BITS), 0);
        assert_eq!(LevelBits::external_words(4 * BITS), 4);
    }

    #[test]
    fn inline_and_external_agree() {
        let mut inline = LevelBits::inline(BITS);
        let mut external = VecBits::external(BITS);

        for bit in (0..BITS).step_by(3) {
            inline.set(bit);
            external.bits.set(bit);
        }
        inline.clear(9);
        external.bits.clear(9);

        for bit in 0..BITS {
            assert_eq!(inline.is_set(bit), external.bits.is_set(bit));
            assert_eq!(
                inline.partner_nibble(bit),
                external.bits.partner_nibble(bit)
            );
        }
        assert_eq!(inline.count_set(), external.bits.count_set());
    }

    #[test]
    fn partner_nibble_covers_sibling_group() {
        let mut b = VecBits::external(4 * BITS);

        let group = BITS + 8;
        assert_eq!(b.bits.partner_nibble(group + 2), 0);

        b.bits.set(group + 3);
        for sibling in group..group + 4 {
            assert_eq!(b.bits.partner_nibble(sibling), 0b1000);
        }

        // Neighbouring groups are unaffected.
        assert_eq!(b.bits.partner_nibble(group - 1), 0);
        assert_eq!(b.bits.partner_nibble(group + 4), 0);

        b.bits.set(group);
        assert_eq!(b.bits.partner_nibble(group + 1), 0b1001);

        b.bits.clear(group + 3);
        b.bits.clear(group);
        assert_eq!(b.bits.partner_nibble(group), 0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_bit_panics() {
        let b = LevelBits::inline(8);
        b.is_set(8);
    }
}
