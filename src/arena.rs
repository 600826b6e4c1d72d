use std::{
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use log::{debug, warn};

use crate::{
    contract, debug,
    error::{Error, Result, VmError},
    kernel,
    utils::{align_up, fill_pattern, is_pow2},
};

/// Reservation used by [`ArenaConfig::default`], address space is cheap.
pub const DEFAULT_RESERVE_SIZE: usize = 1 << 30;

/// Default minimum alignment of every allocation, `1 << 3 = 8` bytes.
pub const DEFAULT_ALIGNMENT_SHIFT: u8 = 3;

/// Largest supported minimum alignment, `1 << 16 = 64 KiB`.
pub const MAX_ALIGNMENT_SHIFT: u8 = 16;

/// How an [`Arena`] is laid out in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Address space claimed up front, rounded up to whole pages. The arena
    /// can never grow past this.
    pub reserve_size: usize,
    /// Bytes committed right away, rounded up to whole pages.
    pub commit_size: usize,
    /// Every allocation is aligned to (and padded to a multiple of)
    /// `1 << alignment_shift` bytes.
    pub alignment_shift: u8,
    /// Minimum number of pages committed each time the arena grows. Larger
    /// values trade committed memory for fewer syscalls.
    pub commit_granularity: u16,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            reserve_size: DEFAULT_RESERVE_SIZE,
            commit_size: 0,
            alignment_shift: DEFAULT_ALIGNMENT_SHIFT,
            commit_granularity: 1,
        }
    }
}

impl ArenaConfig {
    pub fn reserve_size(mut self, size: usize) -> Self {
        self.reserve_size = size;
        self
    }

    pub fn commit_size(mut self, size: usize) -> Self {
        self.commit_size = size;
        self
    }

    pub fn alignment_shift(mut self, shift: u8) -> Self {
        self.alignment_shift = shift;
        self
    }

    pub fn commit_granularity(mut self, pages: u16) -> Self {
        self.commit_granularity = pages;
        self
    }
}

/// Geometry and bump position of an arena, written into the first page(s)
/// of its own reservation (or into a region header). The payload starts at
/// `base` on the next page boundary, or the next multiple of the alignment
/// if that is bigger than a page:
///
/// ```text
/// +-----------------+------------------------------------+-----------------+
/// |  Header pages   |  Committed pages                   |  Reserved only  |
/// |  CursorState .. |  [ used (pos) | free             ] |                 |
/// +-----------------+------------------------------------+-----------------+
/// ^ reservation     ^ base           ^ base + pos        ^ committed end
/// ```
///
/// Header and payload are committed separately so a gap between them (due to
/// a large alignment) never gets backed by memory.
///
/// Invariant: `pos <= committed_size() <= reserved_size()`.
#[repr(C)]
pub(crate) struct CursorState {
    /// Start of the payload.
    base: NonNull<u8>,
    /// Bump position, bytes from `base`.
    pos: usize,
    /// (unit = pages) payload pages reserved.
    reserved_pages: u32,
    /// (unit = pages) payload pages committed.
    committed_pages: u32,
    /// (unit = pages) header pages before the payload, 0 when the cursor
    /// doesn't own its reservation.
    header_pages: u16,
    /// (unit = pages) minimum growth step.
    commit_granularity: u16,
    page_size_shift: u8,
    alignment_shift: u8,
}

impl CursorState {
    /// A cursor over `reserved_pages` pages at `base` that somebody else owns.
    /// Nothing is committed yet.
    pub(crate) fn detached(
        base: NonNull<u8>,
        reserved_pages: u32,
        page_size_shift: u8,
        alignment_shift: u8,
    ) -> Self {
        Self {
            base,
            pos: 0,
            reserved_pages,
            committed_pages: 0,
            header_pages: 0,
            commit_granularity: 1,
            page_size_shift,
            alignment_shift,
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn committed_size(&self) -> usize {
        (self.committed_pages as usize) << self.page_size_shift
    }

    pub(crate) fn reserved_size(&self) -> usize {
        (self.reserved_pages as usize) << self.page_size_shift
    }

    pub(crate) fn used(&self) -> usize {
        self.pos
    }
}

/// The bump allocator itself. [`Arena`], [`crate::ArenaStack`] and
/// [`crate::Region`] own the reservation its state lives in and hand out
/// `&mut ArenaCursor`.
///
/// Unsized, so safe code can't move, swap or overwrite a cursor through the
/// reference. Its state stays in the reservation it describes and the owners
/// read their geometry back from there when they release it.
///
/// ```compile_fail
/// let mut a = vmarena::Arena::new(1 << 20, 0, 3).unwrap();
/// let mut b = vmarena::Arena::new(1 << 20, 0, 3).unwrap();
/// std::mem::swap(&mut *a, &mut *b);
/// ```
#[repr(C)]
pub struct ArenaCursor {
    state: CursorState,
    _unsized: [u8],
}

/// A position inside one particular arena, see [`ArenaCursor::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    arena: usize,
    pos: usize,
}

impl SavePoint {
    /// Offset of the save point from the arena base.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl ArenaCursor {
    /// Views the state at `state` as a cursor.
    ///
    /// ## Safety
    /// `state` must point to an initialized [`CursorState`] that outlives
    /// every reference made from the returned pointer.
    pub(crate) unsafe fn from_state(state: NonNull<CursorState>) -> NonNull<ArenaCursor> {
        // Zero length tail, the cursor covers exactly the state.
        let raw = ptr::slice_from_raw_parts_mut(state.as_ptr().cast::<u8>(), 0) as *mut ArenaCursor;
        unsafe { NonNull::new_unchecked(raw) }
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        1 << self.state.alignment_shift
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.state.page_size_shift
    }

    #[inline]
    pub fn reserved_size(&self) -> usize {
        (self.state.reserved_pages as usize) << self.state.page_size_shift
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        (self.state.committed_pages as usize) << self.state.page_size_shift
    }

    /// Bytes handed out since creation or the last reset.
    #[inline]
    pub fn used(&self) -> usize {
        self.state.pos
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.state.base
    }

    pub fn within_committed(&self, ptr: *const u8) -> bool {
        let base = self.state.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.committed_size()
    }

    #[inline]
    fn pages_for(&self, bytes: usize) -> usize {
        align_up(bytes, self.page_size()) >> self.state.page_size_shift
    }

    #[inline]
    fn page_addr(&self, page: u32) -> NonNull<u8> {
        unsafe { self.state.base.add((page as usize) << self.state.page_size_shift) }
    }

    /// Sets the committed size to `size` bytes rounded up to pages, growing or
    /// shrinking as needed. `pos` is not touched, the committed size never
    /// drops below it.
    pub fn commit(&mut self, size: usize) -> bool {
        let mut want = self.pages_for(size);
        let used = self.pages_for(self.state.pos);
        if !contract!(want >= used, "cannot decommit pages covering pos") {
            want = used;
        }
        if want > self.state.reserved_pages as usize {
            return false;
        }
        let want = want as u32;

        if want > self.state.committed_pages {
            let len = ((want - self.state.committed_pages) as usize) << self.state.page_size_shift;
            let addr = self.page_addr(self.state.committed_pages);
            if let Err(err) = unsafe { kernel::commit(addr, len) } {
                debug!("arena commit failed: {err}");
                return false;
            }
        } else if want < self.state.committed_pages {
            let len = ((self.state.committed_pages - want) as usize) << self.state.page_size_shift;
            if let Err(err) = unsafe { kernel::decommit(self.page_addr(want), len) } {
                debug!("arena decommit failed: {err}");
                return false;
            }
        }

        self.state.committed_pages = want;
        true
    }

    /// Makes sure `[0, end)` is committed, committing at least
    /// `commit_granularity` pages when it has to grow.
    fn ensure_committed(&mut self, end: usize) -> bool {
        let need = self.pages_for(end);
        if need <= self.state.committed_pages as usize {
            return true;
        }
        if need > self.state.reserved_pages as usize {
            return false;
        }

        let step = self.state.committed_pages as usize + self.state.commit_granularity as usize;
        let want = need.max(step).min(self.state.reserved_pages as usize) as u32;
        let len = ((want - self.state.committed_pages) as usize) << self.state.page_size_shift;

        match unsafe { kernel::commit(self.page_addr(self.state.committed_pages), len) } {
            Ok(()) => {
                self.state.committed_pages = want;
                true
            }
            Err(err) => {
                debug!("arena growth to {want} pages failed: {err}");
                false
            }
        }
    }

    /// Allocates `size` bytes rounded up to the arena alignment. Returns `None`
    /// for a zero size, when the reservation is exhausted or when the OS
    /// refuses to commit more pages.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let size = size.checked_add(self.alignment() - 1)? & !(self.alignment() - 1);
        let end = self.state.pos.checked_add(size)?;
        if !self.ensure_committed(end) {
            return None;
        }

        let ptr = unsafe { self.state.base.add(self.state.pos) };
        self.state.pos = end;
        Some(ptr)
    }

    /// Allocates `size` bytes at an address aligned to `align`, which must be a
    /// power of two. Alignments below the arena alignment are raised to it.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !contract!(is_pow2(align), "alignment must be a power of two") {
            return None;
        }

        let align = align.max(self.alignment());
        let current = self.state.base.as_ptr() as usize + self.state.pos;
        let padding = align_up(current, align) - current;

        // The padding goes through the same commit path as the request.
        let ptr = self.alloc(size.checked_add(padding)?)?;
        Some(unsafe { ptr.add(padding) })
    }

    pub fn alloc_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    pub fn alloc_zeroed_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc_aligned(size, align)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Allocates and fills with the little endian bytes of `fill`, repeated.
    pub fn alloc_filled(&mut self, size: usize, fill: u32) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        unsafe { fill_pattern(ptr, size, fill) };
        Some(ptr)
    }

    pub fn alloc_filled_aligned(
        &mut self,
        size: usize,
        align: usize,
        fill: u32,
    ) -> Option<NonNull<u8>> {
        let ptr = self.alloc_aligned(size, align)?;
        unsafe { fill_pattern(ptr, size, fill) };
        Some(ptr)
    }

    /// Room for `len` values of `T`, uninitialized. Empty requests get a
    /// dangling pointer and don't move the cursor.
    pub fn alloc_array<T>(&mut self, len: usize) -> Option<NonNull<T>> {
        let size = mem::size_of::<T>().checked_mul(len)?;
        if size == 0 {
            return Some(NonNull::dangling());
        }
        self.alloc_aligned(size, mem::align_of::<T>()).map(NonNull::cast)
    }

    pub fn alloc_array_zeroed<T>(&mut self, len: usize) -> Option<NonNull<T>> {
        let size = mem::size_of::<T>().checked_mul(len)?;
        if size == 0 {
            return Some(NonNull::dangling());
        }
        self.alloc_zeroed_aligned(size, mem::align_of::<T>()).map(NonNull::cast)
    }

    /// The address the next allocation would start at (before alignment).
    #[inline]
    pub fn current_address(&self) -> NonNull<u8> {
        unsafe { self.state.base.add(self.state.pos) }
    }

    #[inline]
    pub fn save(&self) -> SavePoint {
        SavePoint { arena: self.state.base.as_ptr() as usize, pos: self.state.pos }
    }

    /// Rewinds (or forwards) the cursor to `save`. Everything allocated after
    /// the save point is considered free again, debug builds poison it.
    pub fn restore(&mut self, save: SavePoint) {
        let own = save.arena == self.state.base.as_ptr() as usize;
        if !contract!(own, "save point belongs to another arena") {
            return;
        }
        self.set_pos(save.pos);
    }

    /// Same as [`ArenaCursor::restore`] for an address previously returned by
    /// [`ArenaCursor::current_address`]. Addresses outside of the committed
    /// range are ignored.
    pub fn restore_address(&mut self, addr: NonNull<u8>) {
        let base = self.state.base.as_ptr() as usize;
        let addr = addr.as_ptr() as usize;
        let inside = addr >= base && addr - base <= self.committed_size();
        if !contract!(inside, "address outside of arena") {
            return;
        }
        self.set_pos(addr - base);
    }

    pub(crate) fn set_pos(&mut self, pos: usize) {
        if !contract!(pos <= self.committed_size(), "position beyond committed memory") {
            return;
        }
        if pos < self.state.pos {
            unsafe { debug::poison(self.state.base.add(pos), self.state.pos - pos) };
        }
        self.state.pos = pos;
    }

    /// Saves the current position and restores it when the returned guard is
    /// dropped.
    pub fn scratch(&mut self) -> Scratch<'_> {
        let save = self.save();
        Scratch { arena: self, save }
    }

    /// Decommits the committed pages past the page holding `pos`.
    pub fn shrink(&mut self) {
        let used_pages = self.pages_for(self.state.pos) as u32;
        if used_pages >= self.state.committed_pages {
            return;
        }

        let len =
            ((self.state.committed_pages - used_pages) as usize) << self.state.page_size_shift;
        match unsafe { kernel::decommit(self.page_addr(used_pages), len) } {
            Ok(()) => self.state.committed_pages = used_pages,
            Err(err) => debug!("arena shrink failed: {err}"),
        }
    }

    /// Makes the whole arena available again without decommitting anything.
    pub fn reset(&mut self) {
        self.set_pos(0);
    }
}

/// Scoped temporary allocations, see [`ArenaCursor::scratch`].
pub struct Scratch<'a> {
    arena: &'a mut ArenaCursor,
    save: SavePoint,
}

impl Deref for Scratch<'_> {
    type Target = ArenaCursor;

    fn deref(&self) -> &ArenaCursor {
        &*self.arena
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut ArenaCursor {
        &mut *self.arena
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.arena.restore(self.save);
    }
}

/// Address space slack reserved so the payload can start on an `alignment`
/// boundary even though the OS only guarantees page alignment.
#[inline]
fn alignment_slack(alignment: usize, page_size: usize) -> usize {
    alignment.saturating_sub(page_size)
}

/// Reserves an arena with `header_bytes` of header (at least a
/// [`CursorState`]), commits the header and `commit_size` bytes of payload,
/// and writes the cursor state at the start of the reservation.
///
/// The header bytes after the state are free for the caller to use.
pub(crate) fn create(header_bytes: usize, config: &ArenaConfig) -> Result<NonNull<CursorState>> {
    if config.alignment_shift > MAX_ALIGNMENT_SHIFT {
        return Err(Error::InvalidAlignment {
            shift: config.alignment_shift,
            max: MAX_ALIGNMENT_SHIFT,
        });
    }
    if config.reserve_size == 0 {
        return Err(Error::Zero { what: "arena reserve size" });
    }

    let page_size = kernel::page_size();
    let page_size_shift = kernel::page_size_shift();
    let alignment = 1usize << config.alignment_shift;

    let header_size = align_up(header_bytes.max(mem::size_of::<CursorState>()), page_size);
    let reserved_size = align_up(config.reserve_size, page_size);
    let commit_size = align_up(config.commit_size, page_size).min(reserved_size);
    let slack = alignment_slack(alignment, page_size);

    let header_pages = header_size >> page_size_shift;
    if header_pages > u16::MAX as usize {
        return Err(Error::TooLarge {
            what: "arena header",
            requested: header_size,
            max: (u16::MAX as usize) << page_size_shift,
        });
    }
    let reserved_pages = reserved_size >> page_size_shift;
    if reserved_pages > u32::MAX as usize {
        return Err(Error::TooLarge {
            what: "arena reservation",
            requested: reserved_size,
            max: (u32::MAX as usize) << page_size_shift,
        });
    }

    let total = header_size + slack + reserved_size;

    unsafe {
        let start = kernel::reserve(total)?;
        let base_addr = align_up(start.as_ptr() as usize + header_size, alignment);
        let base = start.add(base_addr - start.as_ptr() as usize);

        let committed = if base_addr == start.as_ptr() as usize + header_size {
            // Header and payload are adjacent, one syscall is enough.
            kernel::commit(start, header_size + commit_size)
        } else {
            kernel::commit(start, header_size).and_then(|()| kernel::commit(base, commit_size))
        };

        if let Err(err) = committed {
            if let Err(release) = kernel::release(start, total) {
                warn!("arena rollback could not release its reservation: {release}");
            }
            return Err(err.into());
        }

        let state = start.cast::<CursorState>();
        state.as_ptr().write(CursorState {
            base,
            pos: 0,
            reserved_pages: reserved_pages as u32,
            committed_pages: (commit_size >> page_size_shift) as u32,
            header_pages: header_pages as u16,
            commit_granularity: config.commit_granularity.max(1),
            page_size_shift,
            alignment_shift: config.alignment_shift,
        });

        debug!(
            "arena created at {start:?}, {reserved_size} bytes reserved, {commit_size} committed"
        );
        Ok(state)
    }
}

/// Decommits everything `state` committed (header included) and releases
/// its reservation.
///
/// ## Safety
/// `state` must come from [`create`] and must not be used afterwards.
pub(crate) unsafe fn destroy(state: NonNull<CursorState>) -> Result<(), VmError> {
    // Copy out everything we need, the state lives in the pages we drop.
    let (base, header_size, committed_size, reserved_size, alignment, page_size) = unsafe {
        let c = state.as_ref();
        (
            c.base,
            (c.header_pages as usize) << c.page_size_shift,
            c.committed_size(),
            c.reserved_size(),
            1usize << c.alignment_shift,
            1usize << c.page_size_shift,
        )
    };
    let start = state.cast::<u8>();
    let total = header_size + alignment_slack(alignment, page_size) + reserved_size;

    unsafe {
        let decommitted = if start.add(header_size) == base {
            kernel::decommit(start, header_size + committed_size)
        } else {
            kernel::decommit(start, header_size).and(kernel::decommit(base, committed_size))
        };
        let released = kernel::release(start, total);

        decommitted.and(released)
    }
}

/// A growable bump allocator over one virtual memory reservation.
///
/// All the allocation methods come from [`ArenaCursor`] through `Deref`.
/// Dropping the arena returns its memory to the OS, use [`Arena::destroy`]
/// to observe whether that worked.
///
/// ```
/// use vmarena::Arena;
///
/// let mut arena = Arena::new(1 << 20, 0, 3).unwrap();
/// let save = arena.save();
/// let a = arena.alloc(100).unwrap();
/// arena.restore(save);
/// assert_eq!(Some(a), arena.alloc(100));
/// ```
pub struct Arena {
    state: NonNull<CursorState>,
}

impl Arena {
    /// Reserves `reserve_size` bytes, commits the first `commit_size` and
    /// aligns every allocation to `1 << alignment_shift`.
    pub fn new(reserve_size: usize, commit_size: usize, alignment_shift: u8) -> Result<Self> {
        Self::with_config(
            &ArenaConfig::default()
                .reserve_size(reserve_size)
                .commit_size(commit_size)
                .alignment_shift(alignment_shift),
        )
    }

    pub fn with_config(config: &ArenaConfig) -> Result<Self> {
        Ok(Self { state: create(mem::size_of::<CursorState>(), config)? })
    }

    /// Decommits and releases everything, reporting OS failures.
    pub fn destroy(self) -> Result<(), VmError> {
        let this = ManuallyDrop::new(self);
        unsafe { destroy(this.state) }
    }
}

impl Deref for Arena {
    type Target = ArenaCursor;

    fn deref(&self) -> &ArenaCursor {
        unsafe { ArenaCursor::from_state(self.state).as_ref() }
    }
}

impl DerefMut for Arena {
    fn deref_mut(&mut self) -> &mut ArenaCursor {
        unsafe { ArenaCursor::from_state(self.state).as_mut() }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(err) = unsafe { destroy(self.state) } {
            warn!("arena destroy failed: {err}");
        }
    }
}
