use std::{
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use log::warn;

use crate::{
    arena::{self, ArenaConfig, ArenaCursor, CursorState},
    error::{Error, Result, VmError},
    kernel,
    utils::align_up,
};

/// Most sub-arenas a single [`Region`] can be sliced into.
pub const MAX_REGION_ARENAS: usize = 256;

/// Header of a region reservation. The sub-arena states follow it directly.
#[repr(C)]
struct RegionHeader {
    /// Describes the whole reservation, never allocated from.
    cursor: CursorState,
    count: u16,
}

/// One reservation carved into equally sized, independently growable
/// arenas that share a single header.
///
/// ```text
/// +--------+----------------+----------------+-----+----------------+
/// | Header |  Arena 0       |  Arena 1       | ... |  Arena N-1     |
/// |        |  [committed..] |  [committed..] |     |  [committed..] |
/// +--------+----------------+----------------+-----+----------------+
/// ```
///
/// Every sub-arena starts with nothing committed and grows on its own, an
/// arena that runs out of its slice fails instead of spilling into the next
/// one.
pub struct Region {
    header: NonNull<RegionHeader>,
}

impl Region {
    /// Reserves `region_reserve` bytes and slices `num_arenas` arenas of
    /// `arena_reserve` bytes (rounded up to pages) out of it. The alignment
    /// may not exceed the page size, sub-arena bases are only page aligned.
    pub fn new(
        region_reserve: usize,
        arena_reserve: usize,
        alignment_shift: u8,
        num_arenas: usize,
    ) -> Result<Self> {
        let page_size = kernel::page_size();
        let page_size_shift = kernel::page_size_shift();

        if num_arenas == 0 {
            return Err(Error::Zero { what: "region arena count" });
        }
        if num_arenas > MAX_REGION_ARENAS {
            return Err(Error::TooLarge {
                what: "region arena count",
                requested: num_arenas,
                max: MAX_REGION_ARENAS,
            });
        }
        if arena_reserve == 0 {
            return Err(Error::Zero { what: "region arena reserve size" });
        }
        if alignment_shift > page_size_shift {
            return Err(Error::InvalidAlignment { shift: alignment_shift, max: page_size_shift });
        }

        let arena_size = align_up(arena_reserve, page_size);
        let arena_pages = arena_size >> page_size_shift;
        if arena_pages > u32::MAX as usize {
            return Err(Error::TooLarge {
                what: "region arena",
                requested: arena_size,
                max: (u32::MAX as usize) << page_size_shift,
            });
        }

        let needed = arena_size.checked_mul(num_arenas).ok_or(Error::TooLarge {
            what: "region arenas",
            requested: usize::MAX,
            max: region_reserve,
        })?;
        let region_size = align_up(region_reserve, page_size);
        if needed > region_size {
            return Err(Error::TooLarge {
                what: "region arenas",
                requested: needed,
                max: region_size,
            });
        }

        let header_bytes =
            mem::size_of::<RegionHeader>() + num_arenas * mem::size_of::<CursorState>();
        let config = ArenaConfig::default()
            .reserve_size(region_size)
            .commit_size(0)
            .alignment_shift(alignment_shift);
        let header = arena::create(header_bytes, &config)?.cast::<RegionHeader>();

        unsafe {
            let base = header.as_ref().cursor.base();
            (&raw mut (*header.as_ptr()).count).write(num_arenas as u16);

            let arenas = header.as_ptr().add(1).cast::<CursorState>();
            for i in 0..num_arenas {
                arenas.add(i).write(CursorState::detached(
                    base.add(i * arena_size),
                    arena_pages as u32,
                    page_size_shift,
                    alignment_shift,
                ));
            }
        }

        Ok(Self { header })
    }

    /// Number of sub-arenas.
    pub fn len(&self) -> usize {
        unsafe { self.header.as_ref().count as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self, index: usize) -> NonNull<CursorState> {
        unsafe { self.header.add(1).cast::<CursorState>().add(index) }
    }

    /// Every sub-arena, in address order.
    pub fn arenas_mut(&mut self) -> impl Iterator<Item = &mut ArenaCursor> + '_ {
        let first = self.state(0);
        (0..self.len()).map(move |i| unsafe { ArenaCursor::from_state(first.add(i)).as_mut() })
    }

    /// The sub-arena at `index`, `None` when out of range.
    pub fn get_arena(&mut self, index: usize) -> Option<&mut ArenaCursor> {
        if index >= self.len() {
            return None;
        }
        Some(unsafe { ArenaCursor::from_state(self.state(index)).as_mut() })
    }

    /// Size of the reservation shared by all sub-arenas.
    pub fn reserved_size(&self) -> usize {
        unsafe { self.header.as_ref().cursor.reserved_size() }
    }

    /// Decommits every sub-arena and releases the shared reservation.
    pub fn destroy(self) -> Result<(), VmError> {
        let mut this = ManuallyDrop::new(self);
        unsafe { this.destroy_in_place() }
    }

    unsafe fn destroy_in_place(&mut self) -> Result<(), VmError> {
        let mut result = Ok(());
        for i in 0..self.len() {
            let arena = unsafe { self.state(i).as_ref() };
            let decommitted = unsafe { kernel::decommit(arena.base(), arena.committed_size()) };
            result = result.and(decommitted);
        }

        let released = unsafe { arena::destroy(self.header.cast()) };
        result.and(released)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.destroy_in_place() } {
            warn!("region destroy failed: {err}");
        }
    }
}
