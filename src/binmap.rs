//! Hierarchical bitmaps with sub-linear free bit search.
//!
//! A binmap is a stack of `u64` levels. The leaf level holds one bit per
//! index (0 = free, 1 = used), every level above it holds one bit per word of
//! the level below, set iff that child word is saturated (all ones). Searching
//! for a free bit then walks one word per level:
//!
//! ```text
//! level 0   [ 0 1 1 ... ]                       1 word
//!             |
//! level 1   [ 1 1 0 1 ... ] [ ... ] ...         up to 64 words
//!                 |
//! leaf      ... [ 1 1 1 1 0 1 ... ] ...         ceil(maxbits / 64) words
//! ```
//!
//! Every level multiplies the capacity by 64, so four levels cover
//! `64^4 = 16M` bits. All levels live contiguously in one word slice, top
//! level first, which lets pools embed the whole map behind their header and
//! commit the (large) leaf level page by page.
//!
//! Two ways to initialize a map:
//!
//! - eager, [`Binmap::clear`] / [`Binmap::fill`] touch every word;
//! - lazy, [`Binmap::setup_used_lazy`] or [`Binmap::setup_free_lazy`] only
//!   write the top word. Indices are then introduced one by one, in
//!   increasing order, with [`Binmap::tick_used_lazy`] or
//!   [`Binmap::tick_free_lazy`], each of which writes only the words that the
//!   new index exposes. Everything above the last ticked index reads as used.

use std::ptr::NonNull;

use crate::{
    contract,
    error::{Error, Result},
};

/// Deepest supported map.
pub const MAX_LEVELS: usize = 4;

/// Largest supported `maxbits`, `64^4`.
pub const MAX_BITS: u32 = 1 << 24;

const FULL: u64 = u64::MAX;

/// Word counts and offsets of every level for a given `maxbits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinmapLayout {
    maxbits: u32,
    levels: u8,
    /// Word offset of each level, top level first.
    offsets: [u32; MAX_LEVELS],
    /// Number of words of each level.
    words: [u32; MAX_LEVELS],
}

/// Fewest levels able to hold `maxbits` bits.
fn min_levels(maxbits: u32) -> u8 {
    match maxbits {
        0..=64 => 1,
        65..=4096 => 2,
        4097..=262_144 => 3,
        _ => 4,
    }
}

impl BinmapLayout {
    /// Layout with the fewest levels that fit `maxbits`.
    pub fn new(maxbits: u32) -> Result<Self> {
        Self::with_levels(maxbits, min_levels(maxbits))
    }

    /// Layout with exactly `levels` levels. More levels than needed is fine,
    /// the extra levels just hold a single word each.
    pub fn with_levels(maxbits: u32, levels: u8) -> Result<Self> {
        if maxbits == 0 {
            return Err(Error::Zero { what: "binmap size" });
        }
        if maxbits > MAX_BITS {
            return Err(Error::TooLarge {
                what: "binmap size",
                requested: maxbits as usize,
                max: MAX_BITS as usize,
            });
        }
        let levels = levels.max(min_levels(maxbits));
        if levels as usize > MAX_LEVELS {
            return Err(Error::TooLarge {
                what: "binmap levels",
                requested: levels as usize,
                max: MAX_LEVELS,
            });
        }

        let mut words = [0u32; MAX_LEVELS];
        let mut bits = maxbits;
        for level in (0..levels as usize).rev() {
            words[level] = bits.div_ceil(64);
            bits = words[level];
        }

        let mut offsets = [0u32; MAX_LEVELS];
        let mut offset = 0;
        for level in 0..levels as usize {
            offsets[level] = offset;
            offset += words[level];
        }

        Ok(Self { maxbits, levels, offsets, words })
    }

    #[inline]
    pub fn maxbits(&self) -> u32 {
        self.maxbits
    }

    #[inline]
    pub fn levels(&self) -> u8 {
        self.levels
    }

    /// Total number of words over all levels.
    pub fn word_count(&self) -> usize {
        let leaf = self.leaf();
        (self.offsets[leaf] + self.words[leaf]) as usize
    }

    /// Word offset of the leaf level, everything before it is summary.
    #[inline]
    pub fn leaf_offset(&self) -> usize {
        self.offsets[self.leaf()] as usize
    }

    #[inline]
    pub fn leaf_words(&self) -> usize {
        self.words[self.leaf()] as usize
    }

    #[inline]
    pub(crate) fn leaf(&self) -> usize {
        self.levels as usize - 1
    }

    #[inline]
    pub(crate) fn level_words(&self, level: usize) -> usize {
        self.words[level] as usize
    }

    /// Number of meaningful bits at `level`.
    #[inline]
    pub(crate) fn level_bits(&self, level: usize) -> u32 {
        if level == self.leaf() { self.maxbits } else { self.words[level + 1] }
    }

    #[inline]
    pub(crate) fn slot(&self, level: usize, word: usize) -> usize {
        self.offsets[level] as usize + word
    }
}

/// Which way [`seek`] walks from its pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Bits of a word at `bit` or beyond it in this direction.
    #[inline]
    fn starting_at(self, bit: usize) -> u64 {
        match self {
            Direction::Up => FULL << bit,
            Direction::Down => FULL >> (63 - bit),
        }
    }

    /// Bits of a word strictly beyond `bit` in this direction.
    #[inline]
    fn beyond(self, bit: usize) -> u64 {
        match self {
            Direction::Up => FULL.checked_shl(bit as u32 + 1).unwrap_or(0),
            Direction::Down => (1 << bit) - 1,
        }
    }

    /// Nearest set bit of a non-zero `word` coming from this direction.
    #[inline]
    fn pick(self, word: u64) -> usize {
        match self {
            Direction::Up => word.trailing_zeros() as usize,
            Direction::Down => 63 - word.leading_zeros() as usize,
        }
    }
}

/// Nearest bit to `pivot` (inclusive) in `direction` whose leaf word has it
/// set in `candidates(level, word)`.
///
/// Looks at the rest of the leaf word holding `pivot`, then at the rest of
/// each ancestor word in turn, and walks back down the first summary bit it
/// finds. Only ancestors of `pivot` and words below a candidate summary bit
/// are read. `candidates` must keep the summary rule: a summary bit is set iff
/// its child word has a candidate.
pub(crate) fn seek(
    layout: &BinmapLayout,
    pivot: u32,
    direction: Direction,
    candidates: impl Fn(usize, usize) -> u64,
) -> Option<u32> {
    if pivot >= layout.maxbits {
        return None;
    }

    let leaf = layout.leaf();
    let mut level = leaf;
    let mut index = pivot as usize;
    let mut mask = direction.starting_at(index & 63);
    loop {
        let word = index >> 6;
        let found = candidates(level, word) & mask;
        if found != 0 {
            index = (word << 6) + direction.pick(found);
            break;
        }
        if level == 0 {
            return None;
        }

        level -= 1;
        index = word;
        mask = direction.beyond(index & 63);
    }

    while level < leaf {
        level += 1;
        let found = candidates(level, index);
        if !contract!(found != 0, "summary bit without a matching child") {
            return None;
        }
        index = (index << 6) + direction.pick(found);
    }
    (index < layout.maxbits as usize).then_some(index as u32)
}

/// Backing storage of a [`Binmap`].
pub trait Words {
    fn len(&self) -> usize;

    fn word(&self, index: usize) -> u64;

    fn set_word(&mut self, index: usize, value: u64);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Words for Vec<u64> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        self[index]
    }

    #[inline]
    fn set_word(&mut self, index: usize, value: u64) {
        self[index] = value;
    }
}

impl Words for &mut [u64] {
    fn len(&self) -> usize {
        <[u64]>::len(self)
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        self[index]
    }

    #[inline]
    fn set_word(&mut self, index: usize, value: u64) {
        self[index] = value;
    }
}

/// Words living in a partially committed VM range.
///
/// No slice is ever formed over the range, only the words a binmap touches
/// are read or written, and the owning pool commits them before that happens.
pub(crate) struct RawWords {
    ptr: NonNull<u64>,
    len: usize,
}

impl RawWords {
    /// ## Safety
    /// `ptr` must be valid for `len` words for as long as this value lives,
    /// except for words that are never accessed.
    pub(crate) unsafe fn new(ptr: NonNull<u64>, len: usize) -> Self {
        Self { ptr, len }
    }
}

impl Words for RawWords {
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).read() }
    }

    #[inline]
    fn set_word(&mut self, index: usize, value: u64) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).write(value) }
    }
}

/// A 1 to 4 level bitmap over some [`Words`].
pub struct Binmap<W> {
    layout: BinmapLayout,
    words: W,
}

impl Binmap<Vec<u64>> {
    /// Heap allocated map with every bit free.
    pub fn new(maxbits: u32) -> Result<Self> {
        let layout = BinmapLayout::new(maxbits)?;
        let mut map = Self { layout, words: vec![0; layout.word_count()] };
        map.clear();
        Ok(map)
    }
}

impl<W: Words> Binmap<W> {
    /// Wraps existing storage, which must hold `layout.word_count()` words.
    /// Nothing is initialized, call one of the setup methods.
    pub fn from_parts(layout: BinmapLayout, words: W) -> Result<Self> {
        if words.len() < layout.word_count() {
            return Err(Error::TooLarge {
                what: "binmap layout",
                requested: layout.word_count(),
                max: words.len(),
            });
        }
        Ok(Self { layout, words })
    }

    /// [`Binmap::from_parts`] for callers that sized the storage from the
    /// layout themselves.
    pub(crate) fn from_sized_parts(layout: BinmapLayout, words: W) -> Self {
        debug_assert!(words.len() >= layout.word_count());
        Self { layout, words }
    }

    #[inline]
    pub fn layout(&self) -> &BinmapLayout {
        &self.layout
    }

    #[inline]
    pub fn maxbits(&self) -> u32 {
        self.layout.maxbits
    }

    pub fn into_words(self) -> W {
        self.words
    }

    /// Marks every bit free. Bits past `maxbits` (the tail of the last word
    /// of every level) are marked used so searches never report them.
    pub fn clear(&mut self) {
        for level in 0..self.layout.levels as usize {
            let words = self.layout.words[level] as usize;
            for word in 0..words {
                self.words.set_word(self.layout.slot(level, word), 0);
            }

            let tail = self.layout.level_bits(level) % 64;
            if tail != 0 {
                self.words.set_word(self.layout.slot(level, words - 1), FULL << tail);
            }
        }
    }

    /// Marks every bit used.
    pub fn fill(&mut self) {
        for index in 0..self.layout.word_count() {
            self.words.set_word(index, FULL);
        }
    }

    /// Raw word `word` of `level`.
    #[inline]
    pub(crate) fn word(&self, level: usize, word: usize) -> u64 {
        self.words.word(self.layout.slot(level, word))
    }

    #[inline]
    fn check(&self, bit: u32) -> bool {
        contract!(bit < self.layout.maxbits, "bit out of range")
    }

    pub fn get(&self, bit: u32) -> bool {
        if !self.check(bit) {
            return false;
        }
        let slot = self.layout.slot(self.layout.leaf(), bit as usize >> 6);
        self.words.word(slot) & (1 << (bit & 63)) != 0
    }

    /// Marks `bit` used, flagging every ancestor whose child word saturates.
    pub fn set(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }

        let mut index = bit as usize;
        for level in (0..self.layout.levels as usize).rev() {
            let slot = self.layout.slot(level, index >> 6);
            let value = self.words.word(slot) | (1 << (index & 63));
            self.words.set_word(slot, value);
            if value != FULL {
                return;
            }
            index >>= 6;
        }
    }

    /// Marks `bit` free, unflagging every ancestor whose child word stops
    /// being saturated.
    pub fn clr(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }

        let mut index = bit as usize;
        for level in (0..self.layout.levels as usize).rev() {
            let slot = self.layout.slot(level, index >> 6);
            let old = self.words.word(slot);
            self.words.set_word(slot, old & !(1 << (index & 63)));
            if old != FULL {
                return;
            }
            index >>= 6;
        }
    }

    /// Lowest free bit.
    pub fn find(&self) -> Option<u32> {
        let mut index = 0usize;
        for level in 0..self.layout.levels as usize {
            let word = self.words.word(self.layout.slot(level, index));
            if word == FULL {
                return None;
            }
            index = (index << 6) + (!word).trailing_zeros() as usize;
        }
        (index < self.layout.maxbits as usize).then_some(index as u32)
    }

    /// Lowest free bit, marked used before returning it.
    pub fn find_and_set(&mut self) -> Option<u32> {
        let bit = self.find()?;
        self.set(bit);
        Some(bit)
    }

    /// Highest free bit.
    pub fn find_last(&self) -> Option<u32> {
        let mut index = 0usize;
        for level in 0..self.layout.levels as usize {
            let word = self.words.word(self.layout.slot(level, index));
            if word == FULL {
                return None;
            }
            index = (index << 6) + (63 - (!word).leading_zeros()) as usize;
        }
        (index < self.layout.maxbits as usize).then_some(index as u32)
    }

    /// Lowest free bit at or above `pivot`. On a lazily set up map `pivot`
    /// must not be past the last ticked index.
    pub fn find_after(&self, pivot: u32) -> Option<u32> {
        seek(&self.layout, pivot, Direction::Up, |level, word| !self.word(level, word))
    }

    /// Highest free bit at or below `pivot`.
    pub fn find_before(&self, pivot: u32) -> Option<u32> {
        seek(&self.layout, pivot, Direction::Down, |level, word| !self.word(level, word))
    }

    /// Starts a map where every index reads as used until ticked in with
    /// [`Binmap::tick_used_lazy`]. Only the top word is written.
    pub fn setup_used_lazy(&mut self) {
        self.words.set_word(0, FULL);
    }

    /// Introduces `bit` as used. Must be called once per index, in increasing
    /// order starting at 0. Writes a fresh all-used word on every level where
    /// `bit` is the first index of a new word.
    pub fn tick_used_lazy(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }

        let mut index = bit as usize;
        for level in (1..self.layout.levels as usize).rev() {
            if index & 63 != 0 {
                return;
            }
            self.words.set_word(self.layout.slot(level, index >> 6), FULL);
            index >>= 6;
        }
    }

    /// Starts a map where every index reads as used until ticked in as free
    /// with [`Binmap::tick_free_lazy`]. Only the top word is written.
    pub fn setup_free_lazy(&mut self) {
        self.words.set_word(0, FULL);
    }

    /// Introduces `bit` as free, same ordering rules as
    /// [`Binmap::tick_used_lazy`].
    pub fn tick_free_lazy(&mut self, bit: u32) {
        if !self.check(bit) {
            return;
        }

        let mut index = bit as usize;
        for level in (0..self.layout.levels as usize).rev() {
            let slot = self.layout.slot(level, index >> 6);
            let old = if index & 63 == 0 { FULL } else { self.words.word(slot) };
            self.words.set_word(slot, old & !(1 << (index & 63)));
            if old != FULL {
                return;
            }
            index >>= 6;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::tests::HANDLER_LOCK;
    use proptest::prelude::*;

    #[test]
    fn layout_levels() {
        assert_eq!(1, BinmapLayout::new(1).unwrap().levels());
        assert_eq!(1, BinmapLayout::new(64).unwrap().levels());
        assert_eq!(2, BinmapLayout::new(65).unwrap().levels());
        assert_eq!(2, BinmapLayout::new(4096).unwrap().levels());
        assert_eq!(3, BinmapLayout::new(4097).unwrap().levels());
        assert_eq!(4, BinmapLayout::new(MAX_BITS).unwrap().levels());

        assert!(matches!(BinmapLayout::new(0), Err(Error::Zero { .. })));
        assert!(matches!(BinmapLayout::new(MAX_BITS + 1), Err(Error::TooLarge { .. })));
        assert!(matches!(BinmapLayout::with_levels(64, 5), Err(Error::TooLarge { .. })));
    }

    #[test]
    fn layout_offsets() {
        // 1 + 2 + 100 words for 6400 bits.
        let layout = BinmapLayout::new(6400).unwrap();
        assert_eq!(3, layout.levels());
        assert_eq!(3, layout.leaf_offset());
        assert_eq!(100, layout.leaf_words());
        assert_eq!(103, layout.word_count());

        let layout = BinmapLayout::new(MAX_BITS).unwrap();
        assert_eq!(1 + 64 + 4096, layout.leaf_offset());
        assert_eq!(1 + 64 + 4096 + 262_144, layout.word_count());

        // Forcing more levels than needed.
        let layout = BinmapLayout::with_levels(100, 3).unwrap();
        assert_eq!(3, layout.levels());
        assert_eq!(4, layout.word_count());
    }

    #[test]
    fn set_get_clr() {
        let mut map = Binmap::new(5000).unwrap();

        for bit in [0, 1, 63, 64, 4095, 4999] {
            assert!(!map.get(bit));
            map.set(bit);
            assert!(map.get(bit));
        }

        map.clr(63);
        assert!(!map.get(63));
        assert!(map.get(64));
    }

    #[test]
    fn find_skips_saturated_words() {
        let mut map = Binmap::new(10_000).unwrap();
        for bit in 0..4100 {
            map.set(bit);
        }
        assert_eq!(Some(4100), map.find());

        map.clr(70);
        assert_eq!(Some(70), map.find());
        assert_eq!(Some(9999), map.find_last());
    }

    #[test]
    fn find_and_set_walks_every_bit_once() {
        for maxbits in [1, 7, 63, 64, 65, 1000, 4096, 4097, 300_000] {
            let mut map = Binmap::new(maxbits).unwrap();
            for expected in 0..maxbits {
                assert_eq!(Some(expected), map.find_and_set());
            }
            assert_eq!(None, map.find());
            assert_eq!(None, map.find_and_set());
            assert_eq!(None, map.find_last());
        }
    }

    #[test]
    fn find_last_returns_highest_free() {
        let mut map = Binmap::new(300).unwrap();
        assert_eq!(Some(299), map.find_last());

        for bit in 150..300 {
            map.set(bit);
        }
        assert_eq!(Some(149), map.find_last());

        map.fill();
        assert_eq!(None, map.find_last());
        map.clr(3);
        assert_eq!(Some(3), map.find_last());
        assert_eq!(Some(3), map.find());
    }

    #[test]
    fn pivot_searches_cross_words_and_levels() {
        let mut map = Binmap::new(20_000).unwrap();
        map.fill();
        for bit in [5, 64, 4095, 4096, 12_345, 19_999] {
            map.clr(bit);
        }

        assert_eq!(Some(5), map.find_after(0));
        assert_eq!(Some(5), map.find_after(5));
        assert_eq!(Some(64), map.find_after(6));
        assert_eq!(Some(4096), map.find_after(4096));
        assert_eq!(Some(12_345), map.find_after(4097));
        assert_eq!(Some(19_999), map.find_after(12_346));
        assert_eq!(None, map.find_after(20_000));

        assert_eq!(Some(19_999), map.find_before(19_999));
        assert_eq!(Some(12_345), map.find_before(19_998));
        assert_eq!(Some(4095), map.find_before(4095));
        assert_eq!(Some(64), map.find_before(4094));
        assert_eq!(None, map.find_before(4));

        map.set(5);
        assert_eq!(None, map.find_before(63));
    }

    #[test]
    fn lazy_free_spans_four_levels() {
        let maxbits = 300_000;
        let mut map = Binmap::new(maxbits).unwrap();
        assert_eq!(4, map.layout().levels());
        map.setup_free_lazy();

        for bit in 0..maxbits {
            map.tick_free_lazy(bit);
        }
        assert_eq!(Some(0), map.find());
        assert_eq!(Some(maxbits - 1), map.find_last());

        for expected in 0..270_000 {
            assert_eq!(Some(expected), map.find_and_set());
        }
        assert_eq!(Some(270_000), map.find());
        map.clr(262_143);
        assert_eq!(Some(262_143), map.find_before(269_999));
        assert_eq!(Some(262_143), map.find_and_set());
        assert_eq!(Some(270_000), map.find_after(100));
    }

    #[test]
    fn lazy_used_reads_untouched_as_used() {
        let mut map = Binmap::new(100_000).unwrap();
        map.setup_used_lazy();
        assert_eq!(None, map.find());

        for bit in 0..5000 {
            map.tick_used_lazy(bit);
            assert_eq!(None, map.find());
        }

        map.clr(4321);
        map.clr(17);
        assert_eq!(Some(17), map.find());
        assert_eq!(Some(4321), map.find_last());

        assert_eq!(Some(17), map.find_and_set());
        assert_eq!(Some(4321), map.find_and_set());
        assert_eq!(None, map.find());
    }

    #[test]
    fn lazy_free_hands_out_ticked_bits() {
        let mut map = Binmap::new(100).unwrap();
        map.setup_free_lazy();
        assert_eq!(None, map.find());

        for bit in 0..70 {
            map.tick_free_lazy(bit);
        }
        assert_eq!(Some(69), map.find_last());

        for expected in 0..70 {
            assert_eq!(Some(expected), map.find_and_set());
        }
        assert_eq!(None, map.find());
    }

    #[test]
    fn lazy_free_touches_only_exposed_words() {
        let layout = BinmapLayout::new(256).unwrap();
        let mut words = vec![0x5555_5555_5555_5555u64; layout.word_count()];
        let mut map = Binmap::from_parts(layout, words.as_mut_slice()).unwrap();

        map.setup_free_lazy();
        map.tick_free_lazy(0);
        map.tick_free_lazy(1);
        map.tick_free_lazy(64);

        let words = map.into_words();
        assert_eq!(!0b11, words[0]);
        assert_eq!(!0b11, words[1]);
        assert_eq!(!0b1, words[2]);
        // Never exposed, still holds whatever was there.
        assert_eq!(0x5555_5555_5555_5555, words[3]);
    }

    #[test]
    fn storage_must_fit_layout() {
        let layout = BinmapLayout::new(1000).unwrap();
        let mut short = vec![0u64; 3];
        assert!(Binmap::from_parts(layout, short.as_mut_slice()).is_err());
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let _guard = HANDLER_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let mut map = Binmap::new(10).unwrap();
        map.set(10);
        assert!(!map.get(10));
        assert_eq!(Some(0), map.find());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u32),
        Clr(u32),
        FindAndSet,
    }

    fn ops(maxbits: u32) -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![
                (0..maxbits).prop_map(Op::Set),
                (0..maxbits).prop_map(Op::Clr),
                Just(Op::FindAndSet),
            ],
            0..200,
        )
    }

    #[derive(Debug, Clone)]
    enum LazyOp {
        Tick(u32),
        Set(u32),
        Clr(u32),
        FindAndSet,
    }

    fn lazy_ops() -> impl Strategy<Value = Vec<LazyOp>> {
        prop::collection::vec(
            prop_oneof![
                (1u32..5000).prop_map(LazyOp::Tick),
                any::<u32>().prop_map(LazyOp::Set),
                any::<u32>().prop_map(LazyOp::Clr),
                Just(LazyOp::FindAndSet),
            ],
            1..48,
        )
    }

    /// Replays `ops` on a lazily set up map. `ticked` bits exist in
    /// `reference`, everything past them must read as used.
    fn check_lazy(maxbits: u32, free: bool, ops: Vec<LazyOp>) -> Result<(), TestCaseError> {
        let mut map = Binmap::new(maxbits).unwrap();
        // Lazy setup must not depend on what the storage held before.
        map.fill();
        if free {
            map.setup_free_lazy();
        } else {
            map.setup_used_lazy();
        }
        let mut reference: Vec<bool> = Vec::new();

        for op in ops {
            let ticked = reference.len() as u32;
            match op {
                LazyOp::Tick(count) => {
                    for bit in ticked..(ticked + count).min(maxbits) {
                        if free {
                            map.tick_free_lazy(bit);
                        } else {
                            map.tick_used_lazy(bit);
                        }
                        reference.push(!free);
                    }
                }
                LazyOp::Set(bit) if ticked > 0 => {
                    map.set(bit % ticked);
                    reference[(bit % ticked) as usize] = true;
                }
                LazyOp::Clr(bit) if ticked > 0 => {
                    map.clr(bit % ticked);
                    reference[(bit % ticked) as usize] = false;
                }
                LazyOp::FindAndSet => {
                    let expected = reference.iter().position(|used| !used);
                    prop_assert_eq!(expected.map(|b| b as u32), map.find_and_set());
                    if let Some(bit) = expected {
                        reference[bit] = true;
                    }
                }
                _ => {}
            }

            let first = reference.iter().position(|used| !used).map(|b| b as u32);
            let last = reference.iter().rposition(|used| !used).map(|b| b as u32);
            prop_assert_eq!(first, map.find());
            prop_assert_eq!(last, map.find_last());
            if let Some(pivot) = reference.len().checked_sub(1) {
                prop_assert_eq!(last, map.find_before(pivot as u32));
                prop_assert_eq!(first, map.find_after(0));
            }
        }

        for (bit, used) in reference.iter().enumerate() {
            prop_assert_eq!(*used, map.get(bit as u32));
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn lazy_used_agrees_with_bool_vector(maxbits in 4097u32..40_000, ops in lazy_ops()) {
            check_lazy(maxbits, false, ops)?;
        }

        #[test]
        fn lazy_free_agrees_with_bool_vector(maxbits in 4097u32..40_000, ops in lazy_ops()) {
            check_lazy(maxbits, true, ops)?;
        }
    }

    proptest! {
        #[test]
        fn agrees_with_bool_vector(
            (maxbits, ops) in (1u32..3000).prop_flat_map(|m| (Just(m), ops(m)))
        ) {
            let mut map = Binmap::new(maxbits).unwrap();
            let mut reference = vec![false; maxbits as usize];

            for op in ops {
                match op {
                    Op::Set(bit) => {
                        map.set(bit);
                        reference[bit as usize] = true;
                    }
                    Op::Clr(bit) => {
                        map.clr(bit);
                        reference[bit as usize] = false;
                    }
                    Op::FindAndSet => {
                        let expected = reference.iter().position(|used| !used);
                        prop_assert_eq!(expected.map(|b| b as u32), map.find_and_set());
                        if let Some(bit) = expected {
                            reference[bit] = true;
                        }
                    }
                }

                let first = reference.iter().position(|used| !used).map(|b| b as u32);
                let last = reference.iter().rposition(|used| !used).map(|b| b as u32);
                prop_assert_eq!(first, map.find());
                prop_assert_eq!(last, map.find_last());
            }

            for (bit, used) in reference.iter().enumerate() {
                prop_assert_eq!(*used, map.get(bit as u32));
            }
        }
    }
}
