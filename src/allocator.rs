use std::{alloc::Layout, ptr::NonNull};

use crate::{
    arena::ArenaCursor,
    bin::{BinClass, RawBin},
    kernel,
};

/// `Layout` based access to the allocators of this crate, so code that only
/// needs "some memory" can take any of them.
///
/// Unlike [`std::alloc::GlobalAlloc`] the allocators are used through `&mut`,
/// none of them is synchronized.
pub trait Allocator {
    /// Memory fitting `layout`, or `None` when the allocator can't provide it.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Gives back memory obtained from [`Allocator::allocate`].
    ///
    /// ## Safety
    /// `ptr` must come from `allocate` on this same allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Bump allocation, memory only comes back on restore or reset.
impl Allocator for ArenaCursor {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc_aligned(layout.size(), layout.align())
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _layout: Layout) {}
}

/// Every request takes a whole slot, requests bigger than a slot or more
/// aligned than slots are refused.
impl<C: BinClass> Allocator for RawBin<C> {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let item_size = self.item_size() as usize;
        // Items start on a page boundary and are `item_size` apart.
        let aligned = layout.align() <= kernel::page_size() && item_size % layout.align() == 0;

        if layout.size() > item_size || !aligned {
            return None;
        }
        self.alloc()
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        // A rejected pointer was already reported through the assert handler.
        let _ = self.free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arena, Bin, debug::tests::HANDLER_LOCK};

    fn fill<A: Allocator + ?Sized>(allocator: &mut A, count: usize) -> Vec<NonNull<u64>> {
        (0..count)
            .map(|i| {
                let ptr = allocator.allocate(Layout::new::<u64>()).unwrap().cast::<u64>();
                unsafe { ptr.as_ptr().write(i as u64) };
                ptr
            })
            .collect()
    }

    #[test]
    fn arena_through_trait() {
        let mut arena = Arena::new(1 << 20, 0, 3).unwrap();
        let values = fill(&mut *arena, 100);

        for (i, ptr) in values.iter().enumerate() {
            assert_eq!(i as u64, unsafe { ptr.as_ptr().read() });
        }

        let wide = arena.allocate(Layout::from_size_align(10, 128).unwrap()).unwrap();
        assert_eq!(0, wide.as_ptr() as usize % 128);
    }

    #[test]
    fn bin_through_trait() {
        let mut bin = Bin::new(16, 64).unwrap();
        let values = fill(&mut bin, 64);
        assert!(bin.allocate(Layout::new::<u64>()).is_none());

        unsafe { bin.deallocate(values[10].cast(), Layout::new::<u64>()) };
        assert_eq!(Some(values[10].cast()), bin.allocate(Layout::new::<u32>()));
    }

    #[test]
    fn bin_ignores_foreign_deallocation() {
        let _guard = HANDLER_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let mut bin = Bin::new(16, 64).unwrap();
        let mut other = Bin::new(16, 64).unwrap();
        fill(&mut bin, 4);
        let foreign = other.allocate(Layout::new::<u64>()).unwrap();

        unsafe { bin.deallocate(foreign, Layout::new::<u64>()) };
        assert_eq!(4, bin.len());
        assert_eq!(1, other.len());
    }

    #[test]
    fn bin_refuses_unfit_layouts() {
        let mut bin = Bin::new(12, 64).unwrap();
        assert!(bin.allocate(Layout::new::<[u8; 13]>()).is_none());
        assert!(bin.allocate(Layout::new::<u64>()).is_none());
        assert!(bin.allocate(Layout::new::<u32>()).is_some());
    }
}
