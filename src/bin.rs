use std::{
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use log::{debug, warn};

use crate::{
    binmap::{Binmap, BinmapLayout, RawWords},
    contract,
    error::{Error, Result, VmError},
    kernel,
    utils::align_up,
};

/// Leaf words committed up front, past the summary levels.
const INITIAL_LEAF_WORDS: usize = 8;

/// Capacity limits of a bin flavour.
pub trait BinClass {
    /// Largest `max_items` accepted by [`RawBin::new`].
    const MAX_ITEMS: u32;

    fn layout(max_items: u32) -> Result<BinmapLayout>;
}

/// Up to `2^24` items, the binmap gets as many levels (1 to 4) as needed.
pub enum Wide {}

/// Up to `65536` items with a fixed 3 level binmap.
pub enum Narrow {}

impl BinClass for Wide {
    const MAX_ITEMS: u32 = crate::binmap::MAX_BITS;

    fn layout(max_items: u32) -> Result<BinmapLayout> {
        BinmapLayout::new(max_items)
    }
}

impl BinClass for Narrow {
    const MAX_ITEMS: u32 = 1 << 16;

    fn layout(max_items: u32) -> Result<BinmapLayout> {
        BinmapLayout::with_levels(max_items, 3)
    }
}

pub type Bin = RawBin<Wide>;
pub type Bin16 = RawBin<Narrow>;

/// Index of a slot in a bin, only valid for the bin that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Written at the start of the reservation, followed by the binmap words.
#[repr(C)]
struct BinHeader {
    item_size: u32,
    capacity: u32,
    /// Live items.
    count: u32,
    /// High-water mark, every index below it has been handed out at least once.
    free_index: u32,
    /// `free_index` at which the next binmap page must be committed.
    binmap_threshold: u32,
    /// (unit = pages) header + binmap pages reserved.
    header_pages: u32,
    /// (unit = pages) header + binmap pages committed.
    header_committed: u32,
    /// (unit = pages) item pages reserved.
    item_pages: u32,
    /// (unit = pages) item pages committed.
    item_committed: u32,
    page_size_shift: u8,
    layout: BinmapLayout,
}

impl BinHeader {
    #[inline]
    fn page_size(&self) -> usize {
        1 << self.page_size_shift
    }

    #[inline]
    fn pages_for(&self, bytes: usize) -> usize {
        align_up(bytes, self.page_size()) >> self.page_size_shift
    }

    /// Highest `free_index` the committed leaf words can describe.
    fn threshold(&self) -> u32 {
        let committed = (self.header_committed as usize) << self.page_size_shift;
        let committed_words = committed.saturating_sub(words_offset()) / 8;
        let leaf_words = committed_words.saturating_sub(self.layout.leaf_offset());
        (leaf_words * 64).min(self.capacity as usize) as u32
    }
}

/// Byte offset of the binmap words from the start of the reservation.
#[inline]
const fn words_offset() -> usize {
    align_up(mem::size_of::<BinHeader>(), mem::align_of::<u64>())
}

/// A pool of same-size items with stable indices.
///
/// The pool is one reservation holding the header, the binmap that tracks
/// live slots, and the items themselves:
///
/// ```text
/// +-----------+--------------------------+-----------------------------+
/// | BinHeader | binmap (summary | leaf)  | items [0] [1] [2] ...       |
/// +-----------+--------------------------+-----------------------------+
/// ^ committed up front ^ grows by pages  ^ page aligned, grows by pages
/// ```
///
/// Fresh slots come from the high-water mark in O(1) and extend the binmap
/// with a lazy tick. Freed slots leave a hole which the next allocation
/// finds again through the binmap in O(levels).
pub struct RawBin<C: BinClass> {
    header: NonNull<BinHeader>,
    items: NonNull<u8>,
    _class: PhantomData<C>,
}

impl<C: BinClass> RawBin<C> {
    pub fn new(item_size: u32, max_items: u32) -> Result<Self> {
        if item_size == 0 {
            return Err(Error::Zero { what: "bin item size" });
        }
        if max_items == 0 {
            return Err(Error::Zero { what: "bin capacity" });
        }
        if max_items > C::MAX_ITEMS {
            return Err(Error::TooLarge {
                what: "bin capacity",
                requested: max_items as usize,
                max: C::MAX_ITEMS as usize,
            });
        }

        let page_size = kernel::page_size();
        let page_size_shift = kernel::page_size_shift();
        let layout = C::layout(max_items)?;

        let header_size = align_up(words_offset() + layout.word_count() * 8, page_size);
        let items_size = align_up(item_size as usize * max_items as usize, page_size);
        let initial_words = layout.leaf_offset() + layout.leaf_words().min(INITIAL_LEAF_WORDS);
        let header_commit = align_up(words_offset() + initial_words * 8, page_size);
        let item_commit = page_size.min(items_size);
        let total = header_size + items_size;

        unsafe {
            let start = kernel::reserve(total)?;
            let items = start.add(header_size);

            let committed = if header_commit == header_size {
                kernel::commit(start, header_commit + item_commit)
            } else {
                kernel::commit(start, header_commit)
                    .and_then(|()| kernel::commit(items, item_commit))
            };
            if let Err(err) = committed {
                if let Err(release) = kernel::release(start, total) {
                    warn!("bin rollback could not release its reservation: {release}");
                }
                return Err(err.into());
            }

            let header = start.cast::<BinHeader>();
            header.as_ptr().write(BinHeader {
                item_size,
                capacity: max_items,
                count: 0,
                free_index: 0,
                binmap_threshold: 0,
                header_pages: (header_size >> page_size_shift) as u32,
                header_committed: (header_commit >> page_size_shift) as u32,
                item_pages: (items_size >> page_size_shift) as u32,
                item_committed: (item_commit >> page_size_shift) as u32,
                page_size_shift,
                layout,
            });

            let mut bin = Self { header, items, _class: PhantomData };
            let threshold = bin.header().threshold();
            bin.header_mut().binmap_threshold = threshold;
            bin.binmap().setup_used_lazy();

            debug!(
                "bin created at {start:?}, {max_items} x {item_size} bytes, {} binmap levels",
                layout.levels()
            );
            Ok(bin)
        }
    }

    #[inline]
    fn header(&self) -> &BinHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut BinHeader {
        unsafe { self.header.as_mut() }
    }

    #[inline]
    fn binmap(&self) -> Binmap<RawWords> {
        let layout = self.header().layout;
        let words = unsafe {
            let first = self.header.cast::<u8>().add(words_offset()).cast();
            RawWords::new(first, layout.word_count())
        };
        Binmap::from_sized_parts(layout, words)
    }

    /// Live items.
    #[inline]
    pub fn len(&self) -> u32 {
        self.header().count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    #[inline]
    pub fn item_size(&self) -> u32 {
        self.header().item_size
    }

    /// Number of slots ever handed out, live or recycled.
    #[inline]
    pub fn high_water_mark(&self) -> u32 {
        self.header().free_index
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        unsafe { self.items.add(index as usize * self.item_size() as usize) }
    }

    /// Commits the next binmap page. The header reservation always has room
    /// for it, the threshold only stays below capacity while it does.
    fn grow_binmap(&mut self) -> bool {
        let header = self.header();
        let committed = (header.header_committed as usize) << header.page_size_shift;
        let addr = unsafe { self.header.cast::<u8>().add(committed) };

        if let Err(err) = unsafe { kernel::commit(addr, header.page_size()) } {
            debug!("bin binmap growth failed: {err}");
            return false;
        }

        let header = self.header_mut();
        header.header_committed += 1;
        header.binmap_threshold = header.threshold();
        true
    }

    /// Commits item pages until slot `index` is fully backed.
    fn grow_items(&mut self, index: u32) -> bool {
        let header = self.header();
        let need = header.pages_for((index as usize + 1) * header.item_size as usize) as u32;
        if need <= header.item_committed {
            return true;
        }

        let offset = (header.item_committed as usize) << header.page_size_shift;
        let len = ((need - header.item_committed) as usize) << header.page_size_shift;
        if let Err(err) = unsafe { kernel::commit(self.items.add(offset), len) } {
            debug!("bin item growth failed: {err}");
            return false;
        }

        self.header_mut().item_committed = need;
        true
    }

    /// A slot of `item_size()` bytes. `None` when the pool is full or the OS
    /// refuses to commit more memory.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        self.alloc_index().map(|index| self.slot_ptr(index))
    }

    fn alloc_index(&mut self) -> Option<u32> {
        let header = self.header();
        if header.count >= header.capacity {
            return None;
        }

        // A hole below the high-water mark.
        if header.count < header.free_index {
            let index = self.binmap().find_and_set();
            if contract!(index.is_some(), "bin binmap lost track of a hole") {
                self.header_mut().count += 1;
            }
            return index;
        }

        let index = header.free_index;
        if index >= header.binmap_threshold && !self.grow_binmap() {
            return None;
        }
        if !self.grow_items(index) {
            return None;
        }

        self.binmap().tick_used_lazy(index);
        let header = self.header_mut();
        header.free_index += 1;
        header.count += 1;
        Some(index)
    }

    /// Returns the slot at `ptr` to the pool. Pointers that don't point at
    /// a live slot are ignored and `false` is returned.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        match self.ptr2idx(ptr) {
            Some(index) => self.free_at(index),
            None => {
                contract!(false, "freeing a pointer that doesn't belong to this bin");
                false
            }
        }
    }

    fn free_at(&mut self, index: u32) -> bool {
        let mut binmap = self.binmap();
        if !contract!(binmap.get(index), "freeing a slot that is not live") {
            return false;
        }

        binmap.clr(index);
        self.header_mut().count -= 1;
        true
    }

    /// Index of the slot `ptr` points at, if it is below the high-water mark.
    pub fn ptr2idx(&self, ptr: NonNull<u8>) -> Option<u32> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.items.as_ptr() as usize)?;
        let item_size = self.item_size() as usize;
        let index = offset / item_size;

        (offset % item_size == 0 && index < self.high_water_mark() as usize).then_some(index as u32)
    }

    /// Address of slot `index`, if it is below the high-water mark.
    pub fn idx2ptr(&self, index: u32) -> Option<NonNull<u8>> {
        (index < self.high_water_mark()).then(|| self.slot_ptr(index))
    }

    /// Whether slot `index` currently holds a live item.
    pub fn is_live(&self, index: u32) -> bool {
        index < self.high_water_mark() && self.binmap().get(index)
    }

    /// Highest recyclable hole below the high-water mark, callers can use it
    /// to decide whether the tail of the pool is worth trimming.
    pub fn highest_free(&self) -> Option<u32> {
        self.binmap().find_last()
    }

    pub fn alloc_slot(&mut self) -> Option<SlotIndex> {
        self.alloc_index().map(SlotIndex)
    }

    pub fn free_slot(&mut self, slot: SlotIndex) -> bool {
        if !contract!(slot.0 < self.high_water_mark(), "slot out of range") {
            return false;
        }
        self.free_at(slot.0)
    }

    pub fn item(&self, slot: SlotIndex) -> Option<&[u8]> {
        let len = self.item_size() as usize;
        self.is_live(slot.0)
            .then(|| unsafe { std::slice::from_raw_parts(self.slot_ptr(slot.0).as_ptr(), len) })
    }

    pub fn item_mut(&mut self, slot: SlotIndex) -> Option<&mut [u8]> {
        let len = self.item_size() as usize;
        self.is_live(slot.0)
            .then(|| unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(slot.0).as_ptr(), len) })
    }

    /// Decommits and releases the pool, reporting OS failures.
    pub fn destroy(self) -> Result<(), VmError> {
        let this = ManuallyDrop::new(self);
        unsafe { this.release() }
    }

    unsafe fn release(&self) -> Result<(), VmError> {
        let header = self.header();
        let shift = header.page_size_shift;
        let header_size = (header.header_pages as usize) << shift;
        let header_committed = (header.header_committed as usize) << shift;
        let item_committed = (header.item_committed as usize) << shift;
        let total = header_size + ((header.item_pages as usize) << shift);
        let start = self.header.cast::<u8>();

        unsafe {
            let decommitted = if header_committed == header_size {
                kernel::decommit(start, header_size + item_committed)
            } else {
                kernel::decommit(start, header_committed)
                    .and(kernel::decommit(self.items, item_committed))
            };
            decommitted.and(kernel::release(start, total))
        }
    }
}

impl<C: BinClass> Drop for RawBin<C> {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.release() } {
            warn!("bin destroy failed: {err}");
        }
    }
}
