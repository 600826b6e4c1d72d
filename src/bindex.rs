use std::{
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use log::{debug, warn};

use crate::{
    debug,
    error::{Error, Result, VmError},
    kernel,
    utils::align_up,
};

/// Largest capacity of a [`Bindex`], owner indices are `u16`.
pub const MAX_BINDEX_ITEMS: u32 = u16::MAX as u32;

/// What [`Bindex::free`] did to keep the pool dense.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The last item was moved into the freed slot. Whatever refers to
    /// `owner` must now use the freed index.
    Moved { owner: u16 },
    /// The freed slot was the last one, nothing moved.
    Last,
}

#[repr(C)]
struct BindexHeader {
    item_size: u32,
    capacity: u32,
    count: u32,
    /// (unit = pages) header + owner array pages reserved.
    header_pages: u32,
    /// (unit = pages) header + owner array pages committed.
    header_committed: u32,
    /// (unit = pages) item pages reserved.
    item_pages: u32,
    /// (unit = pages) item pages committed.
    item_committed: u32,
    page_size_shift: u8,
}

#[inline]
const fn owners_offset() -> usize {
    align_up(mem::size_of::<BindexHeader>(), mem::align_of::<u16>())
}

/// A dense pool of same-size items.
///
/// Items always occupy `[0, len)`. Freeing a slot moves the last item into
/// the hole, so indices are not stable: every item carries the index of its
/// owner (some external record) and [`Bindex::free`] reports which owner was
/// moved so the caller can patch it.
///
/// ```
/// use vmarena::{Bindex, Removal};
///
/// let mut pool = Bindex::new(16, 100).unwrap();
/// let a = pool.alloc(7).unwrap();
/// let _ = pool.alloc(8).unwrap();
/// assert_eq!(Removal::Moved { owner: 8 }, pool.free(a).unwrap());
/// assert_eq!(Some(8), pool.owner(a));
/// ```
pub struct Bindex {
    header: NonNull<BindexHeader>,
    items: NonNull<u8>,
}

impl Bindex {
    pub fn new(item_size: u32, max_items: u32) -> Result<Self> {
        if item_size == 0 {
            return Err(Error::Zero { what: "bindex item size" });
        }
        if max_items == 0 {
            return Err(Error::Zero { what: "bindex capacity" });
        }
        if max_items > MAX_BINDEX_ITEMS {
            return Err(Error::TooLarge {
                what: "bindex capacity",
                requested: max_items as usize,
                max: MAX_BINDEX_ITEMS as usize,
            });
        }

        let page_size = kernel::page_size();
        let page_size_shift = kernel::page_size_shift();

        let owners_size = max_items as usize * mem::size_of::<u16>();
        let header_size = align_up(owners_offset() + owners_size, page_size);
        let items_size = align_up(item_size as usize * max_items as usize, page_size);
        let total = header_size + items_size;

        unsafe {
            let start = kernel::reserve(total)?;
            if let Err(err) = kernel::commit(start, page_size) {
                if let Err(release) = kernel::release(start, total) {
                    warn!("bindex rollback could not release its reservation: {release}");
                }
                return Err(err.into());
            }

            let header = start.cast::<BindexHeader>();
            header.as_ptr().write(BindexHeader {
                item_size,
                capacity: max_items,
                count: 0,
                header_pages: (header_size >> page_size_shift) as u32,
                header_committed: 1,
                item_pages: (items_size >> page_size_shift) as u32,
                item_committed: 0,
                page_size_shift,
            });

            debug!("bindex created at {start:?}, {max_items} items of {item_size} bytes");
            Ok(Self { header, items: start.add(header_size) })
        }
    }

    #[inline]
    fn header(&self) -> &BindexHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut BindexHeader {
        unsafe { self.header.as_mut() }
    }

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

    #[inline]
    fn owners(&self) -> NonNull<u16> {
        unsafe { self.header.cast::<u8>().add(owners_offset()).cast() }
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        unsafe { self.items.add(index as usize * self.item_size() as usize) }
    }

    /// Commits whatever is missing for slot `index` in both the owner array
    /// and the item array.
    fn grow_to(&mut self, index: u32) -> bool {
        let header = self.header();
        let shift = header.page_size_shift;
        let page_size = 1usize << shift;

        let owners_end = owners_offset() + (index as usize + 1) * 2;
        let owner_pages = (align_up(owners_end, page_size) >> shift) as u32;
        if owner_pages > header.header_committed {
            let committed = (header.header_committed as usize) << shift;
            let addr = unsafe { self.header.cast::<u8>().add(committed) };
            let len = ((owner_pages - header.header_committed) as usize) << shift;
            if let Err(err) = unsafe { kernel::commit(addr, len) } {
                debug!("bindex owner array growth failed: {err}");
                return false;
            }
            self.header_mut().header_committed = owner_pages;
        }

        let header = self.header();
        let items_end = (index as usize + 1) * header.item_size as usize;
        let item_pages = (align_up(items_end, page_size) >> shift) as u32;
        if item_pages > header.item_committed {
            let addr = unsafe { self.items.add((header.item_committed as usize) << shift) };
            let len = ((item_pages - header.item_committed) as usize) << shift;
            if let Err(err) = unsafe { kernel::commit(addr, len) } {
                debug!("bindex item growth failed: {err}");
                return false;
            }
            self.header_mut().item_committed = item_pages;
        }

        true
    }

    /// Appends an item owned by `owner` and returns its index. The item bytes
    /// are left as they are, zero for never used memory.
    pub fn alloc(&mut self, owner: u16) -> Option<u32> {
        let index = self.len();
        if index >= self.capacity() || !self.grow_to(index) {
            return None;
        }

        unsafe { self.owners().add(index as usize).write(owner) };
        self.header_mut().count += 1;
        Some(index)
    }

    /// Frees slot `index` by moving the last item into it.
    pub fn free(&mut self, index: u32) -> Result<Removal> {
        let count = self.len();
        if index >= count {
            return Err(Error::IndexOutOfRange { index, len: count });
        }

        let last = count - 1;
        let item_size = self.item_size() as usize;
        let removal = if index == last {
            Removal::Last
        } else {
            unsafe {
                let (src, dst) = (self.slot_ptr(last), self.slot_ptr(index));
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), item_size);
                let owner = self.owners().add(last as usize).read();
                self.owners().add(index as usize).write(owner);
                Removal::Moved { owner }
            }
        };

        unsafe { debug::poison(self.slot_ptr(last), item_size) };
        self.header_mut().count = last;
        Ok(removal)
    }

    /// Address of live slot `index`.
    pub fn idx2ptr(&self, index: u32) -> Option<NonNull<u8>> {
        (index < self.len()).then(|| self.slot_ptr(index))
    }

    /// Index of the live slot `ptr` points at.
    pub fn ptr2idx(&self, ptr: NonNull<u8>) -> Option<u32> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.items.as_ptr() as usize)?;
        let item_size = self.item_size() as usize;
        let index = offset / item_size;

        (offset % item_size == 0 && index < self.len() as usize).then_some(index as u32)
    }

    pub fn owner(&self, index: u32) -> Option<u16> {
        (index < self.len()).then(|| unsafe { self.owners().add(index as usize).read() })
    }

    pub fn item(&self, index: u32) -> Option<&[u8]> {
        let len = self.item_size() as usize;
        (index < self.len())
            .then(|| unsafe { std::slice::from_raw_parts(self.slot_ptr(index).as_ptr(), len) })
    }

    pub fn item_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let len = self.item_size() as usize;
        (index < self.len())
            .then(|| unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(index).as_ptr(), len) })
    }

    /// Every live item with its owner, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        (0..self.len()).filter_map(|index| Some((self.owner(index)?, self.item(index)?)))
    }

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
            kernel::decommit(start, header_committed)
                .and(kernel::decommit(self.items, item_committed))
                .and(kernel::release(start, total))
        }
    }
}

impl Drop for Bindex {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.release() } {
            warn!("bindex destroy failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write_u64(pool: &mut Bindex, index: u32, value: u64) {
        pool.item_mut(index).unwrap()[..8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(pool: &Bindex, index: u32) -> u64 {
        u64::from_le_bytes(pool.item(index).unwrap()[..8].try_into().unwrap())
    }

    #[test]
    fn free_moves_last_item_down() {
        let mut pool = Bindex::new(32, 10).unwrap();
        for owner in 0..5u16 {
            let index = pool.alloc(owner).unwrap();
            assert_eq!(owner as u32, index);
            write_u64(&mut pool, index, 100 + owner as u64);
        }

        assert_eq!(Removal::Moved { owner: 4 }, pool.free(1).unwrap());
        assert_eq!(4, pool.len());
        assert_eq!(104, read_u64(&pool, 1));
        assert_eq!(Some(4), pool.owner(1));
        assert_eq!(None, pool.owner(4));
    }

    #[test]
    fn free_last_moves_nothing() {
        let mut pool = Bindex::new(8, 10).unwrap();
        pool.alloc(0).unwrap();
        pool.alloc(1).unwrap();

        assert_eq!(Removal::Last, pool.free(1).unwrap());
        assert_eq!(Removal::Last, pool.free(0).unwrap());
        assert!(pool.is_empty());
    }

    #[test]
    fn free_out_of_range() {
        let mut pool = Bindex::new(8, 10).unwrap();
        pool.alloc(0).unwrap();

        assert!(matches!(pool.free(1), Err(Error::IndexOutOfRange { index: 1, len: 1 })));
        assert!(matches!(pool.free(50), Err(Error::IndexOutOfRange { .. })));
        assert_eq!(1, pool.len());
    }

    #[test]
    fn capacity_is_exact() {
        let mut pool = Bindex::new(4, 10).unwrap();
        for owner in 0..10 {
            assert!(pool.alloc(owner).is_some());
        }
        assert!(pool.alloc(10).is_none());

        assert!(matches!(Bindex::new(4, MAX_BINDEX_ITEMS + 1), Err(Error::TooLarge { .. })));
        assert!(matches!(Bindex::new(0, 10), Err(Error::Zero { .. })));
    }

    #[test]
    fn grows_across_pages() {
        let mut pool = Bindex::new(256, MAX_BINDEX_ITEMS).unwrap();
        for owner in 0..MAX_BINDEX_ITEMS as u16 {
            let index = pool.alloc(owner).unwrap();
            write_u64(&mut pool, index, owner as u64);
        }
        assert!(pool.alloc(0).is_none());

        assert_eq!(Removal::Moved { owner: u16::MAX - 1 }, pool.free(0).unwrap());
        assert_eq!((u16::MAX - 1) as u64, read_u64(&pool, 0));
        assert!(pool.destroy().is_ok());
    }

    #[test]
    fn pointers_and_indices() {
        let mut pool = Bindex::new(24, 10).unwrap();
        pool.alloc(0).unwrap();
        pool.alloc(1).unwrap();

        let ptr = pool.idx2ptr(1).unwrap();
        assert_eq!(Some(1), pool.ptr2idx(ptr));
        assert_eq!(None, pool.ptr2idx(unsafe { ptr.add(3) }));
        assert_eq!(None, pool.idx2ptr(2));

        pool.free(1).unwrap();
        assert_eq!(None, pool.ptr2idx(ptr));
    }

    #[test]
    fn iterates_live_items_only() {
        let mut pool = Bindex::new(8, 10).unwrap();
        for owner in [10, 20, 30] {
            let index = pool.alloc(owner).unwrap();
            write_u64(&mut pool, index, owner as u64);
        }
        pool.free(0).unwrap();

        let owners: Vec<_> = pool.iter().map(|(owner, _)| owner).collect();
        assert_eq!(vec![30, 20], owners);
    }

    proptest! {
        #[test]
        fn stays_dense(ops in prop::collection::vec(any::<Option<prop::sample::Index>>(), 1..300)) {
            let mut pool = Bindex::new(8, 64).unwrap();
            let mut model: Vec<(u16, u64)> = Vec::new();
            let mut next_owner = 0u16;

            for op in ops {
                match op {
                    None => {
                        let owner = next_owner;
                        next_owner = next_owner.wrapping_add(1);
                        match pool.alloc(owner) {
                            Some(index) => {
                                prop_assert_eq!(model.len() as u32, index);
                                write_u64(&mut pool, index, owner as u64 * 3);
                                model.push((owner, owner as u64 * 3));
                            }
                            None => prop_assert_eq!(64, model.len()),
                        }
                    }
                    Some(pick) if !model.is_empty() => {
                        let index = pick.index(model.len());
                        let moved = model.len() - 1 != index;
                        model.swap_remove(index);

                        let removal = pool.free(index as u32).unwrap();
                        if moved {
                            prop_assert_eq!(Removal::Moved { owner: model[index].0 }, removal);
                        } else {
                            prop_assert_eq!(Removal::Last, removal);
                        }
                    }
                    Some(_) => {}
                }

                prop_assert_eq!(model.len() as u32, pool.len());
                for (index, (owner, value)) in model.iter().enumerate() {
                    prop_assert_eq!(Some(*owner), pool.owner(index as u32));
                    prop_assert_eq!(*value, read_u64(&pool, index as u32));
                }
            }
        }
    }
}
