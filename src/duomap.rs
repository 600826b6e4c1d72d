//! A [`Binmap`] that can also search for used bits.
//!
//! The leaf level and the "saturated" summary levels are those of a plain
//! binmap. Next to them sits a second set of summary levels, same shape, where
//! a bit is set iff its child word holds no `1` at all. Searching for a `0`
//! walks the first tree, searching for a `1` walks the second one, both in
//! O(levels).

use crate::{
    binmap::{self, Binmap, BinmapLayout, Direction, Words},
    contract,
    error::{Error, Result},
};

const FULL: u64 = u64::MAX;

/// A 1 to 4 level bitmap tracking both free (`0`) and used (`1`) bits.
///
/// ```
/// use vmarena::Duomap;
///
/// let mut map = Duomap::new(1000).unwrap();
/// map.set(10);
/// map.set(700);
/// assert_eq!(Some(10), map.find1());
/// assert_eq!(Some(700), map.find1_after(11));
/// assert_eq!(Some(9), map.find0_before(10));
/// ```
pub struct Duomap<W> {
    zeros: Binmap<W>,
    /// Summary levels only, at the offsets they have in `zeros`.
    empty: W,
}

impl Duomap<Vec<u64>> {
    /// Heap allocated map with every bit `0`.
    pub fn new(maxbits: u32) -> Result<Self> {
        let layout = BinmapLayout::new(maxbits)?;
        let zeros = Binmap::from_sized_parts(layout, vec![0; layout.word_count()]);
        let mut map = Self { zeros, empty: vec![0; layout.leaf_offset()] };
        map.clear();
        Ok(map)
    }
}

impl<W: Words> Duomap<W> {
    /// Wraps existing storage: `words` holds `layout.word_count()` words,
    /// `empty` the `layout.leaf_offset()` words of the second summary.
    /// Nothing is initialized, call [`Duomap::clear`] or [`Duomap::fill`].
    pub fn from_parts(layout: BinmapLayout, words: W, empty: W) -> Result<Self> {
        if empty.len() < layout.leaf_offset() {
            return Err(Error::TooLarge {
                what: "duomap layout",
                requested: layout.leaf_offset(),
                max: empty.len(),
            });
        }
        Ok(Self { zeros: Binmap::from_parts(layout, words)?, empty })
    }

    #[inline]
    pub fn layout(&self) -> &BinmapLayout {
        self.zeros.layout()
    }

    #[inline]
    pub fn maxbits(&self) -> u32 {
        self.zeros.maxbits()
    }

    /// Every bit `0`.
    pub fn clear(&mut self) {
        self.zeros.clear();
        self.reset_empty(false);
    }

    /// Every bit `1`.
    pub fn fill(&mut self) {
        self.zeros.fill();
        self.reset_empty(true);
    }

    /// Rewrites the second summary. Children that don't exist always read as
    /// empty.
    fn reset_empty(&mut self, has_ones: bool) {
        let layout = *self.layout();
        for level in 0..layout.leaf() {
            let words = layout.level_words(level);
            let value = if has_ones { 0 } else { FULL };
            for word in 0..words {
                self.empty.set_word(layout.slot(level, word), value);
            }

            let tail = layout.level_bits(level) % 64;
            if has_ones && tail != 0 {
                self.empty.set_word(layout.slot(level, words - 1), FULL << tail);
            }
        }
    }

    /// The `1` bits of leaf word `word`, without the tail past `maxbits`.
    fn leaf_ones(&self, word: usize) -> u64 {
        let layout = self.layout();
        let value = self.zeros.word(layout.leaf(), word);
        let tail = layout.maxbits() % 64;
        if tail != 0 && word == layout.leaf_words() - 1 {
            value & !(FULL << tail)
        } else {
            value
        }
    }

    /// Words of `level` that hold a `1` below them, as a mask.
    fn ones_at(&self, level: usize, word: usize) -> u64 {
        let layout = self.layout();
        if level == layout.leaf() {
            self.leaf_ones(word)
        } else {
            !self.empty.word(layout.slot(level, word))
        }
    }

    #[inline]
    fn check(&self, bit: u32) -> bool {
        contract!(bit < self.maxbits(), "bit out of range")
    }

    pub fn get(&self, bit: u32) -> bool {
        self.zeros.get(bit)
    }

    pub fn set(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }
        self.zeros.set(bit);

        // Unflag every ancestor that just stopped being empty.
        let layout = *self.layout();
        let mut index = bit as usize >> 6;
        for level in (0..layout.leaf()).rev() {
            let slot = layout.slot(level, index >> 6);
            let old = self.empty.word(slot);
            self.empty.set_word(slot, old & !(1 << (index & 63)));
            if old != FULL {
                return;
            }
            index >>= 6;
        }
    }

    pub fn clr(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }
        self.zeros.clr(bit);

        let mut index = bit as usize >> 6;
        if self.leaf_ones(index) != 0 {
            return;
        }
        let layout = *self.layout();
        for level in (0..layout.leaf()).rev() {
            let slot = layout.slot(level, index >> 6);
            let value = self.empty.word(slot) | (1 << (index & 63));
            self.empty.set_word(slot, value);
            if value != FULL {
                return;
            }
            index >>= 6;
        }
    }

    /// Lowest `0` bit.
    pub fn find0(&self) -> Option<u32> {
        self.zeros.find()
    }

    /// Lowest `0` bit, set before returning it.
    pub fn find0_and_set(&mut self) -> Option<u32> {
        let bit = self.zeros.find()?;
        self.set(bit);
        Some(bit)
    }

    /// Highest `0` bit.
    pub fn find0_last(&self) -> Option<u32> {
        self.zeros.find_last()
    }

    pub fn find0_last_and_set(&mut self) -> Option<u32> {
        let bit = self.zeros.find_last()?;
        self.set(bit);
        Some(bit)
    }

    /// Lowest `0` bit at or above `pivot`.
    pub fn find0_after(&self, pivot: u32) -> Option<u32> {
        self.zeros.find_after(pivot)
    }

    /// Highest `0` bit at or below `pivot`.
    pub fn find0_before(&self, pivot: u32) -> Option<u32> {
        self.zeros.find_before(pivot)
    }

    /// Lowest `1` bit.
    pub fn find1(&self) -> Option<u32> {
        self.find1_after(0)
    }

    /// Lowest `1` bit, cleared before returning it.
    pub fn find1_and_clr(&mut self) -> Option<u32> {
        let bit = self.find1()?;
        self.clr(bit);
        Some(bit)
    }

    /// Highest `1` bit.
    pub fn find1_last(&self) -> Option<u32> {
        self.find1_before(self.maxbits() - 1)
    }

    pub fn find1_last_and_clr(&mut self) -> Option<u32> {
        let bit = self.find1_last()?;
        self.clr(bit);
        Some(bit)
    }

    /// Lowest `1` bit at or above `pivot`.
    pub fn find1_after(&self, pivot: u32) -> Option<u32> {
        binmap::seek(self.layout(), pivot, Direction::Up, |level, word| self.ones_at(level, word))
    }

    /// Highest `1` bit at or below `pivot`.
    pub fn find1_before(&self, pivot: u32) -> Option<u32> {
        binmap::seek(self.layout(), pivot, Direction::Down, |level, word| {
            self.ones_at(level, word)
        })
    }
}
