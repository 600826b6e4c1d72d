use std::{
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use log::warn;

use crate::{
    arena::{self, ArenaConfig, ArenaCursor, CursorState},
    contract,
    error::{Error, Result, VmError},
};

/// Deepest nesting an [`ArenaStack`] supports.
pub const MAX_STACK_DEPTH: u32 = 1024;

/// Header of a stack reservation. The saved positions follow it directly.
#[repr(C)]
struct StackHeader {
    cursor: CursorState,
    depth: u32,
    max_depth: u32,
}

/// An arena with a bounded LIFO of save points.
///
/// [`ArenaStack::push`] opens a scope and hands out the arena,
/// [`ArenaStack::pop`] discards everything allocated since the matching push.
///
/// ```
/// use vmarena::ArenaStack;
///
/// let mut stack = ArenaStack::new(1 << 20, 0, 8).unwrap();
/// let outer = stack.push().unwrap().alloc(64).unwrap();
/// stack.push().unwrap().alloc(1024).unwrap();
/// assert!(stack.pop());
/// assert_eq!(64, stack.arena().used());
/// # let _ = outer;
/// ```
pub struct ArenaStack {
    header: NonNull<StackHeader>,
}

impl ArenaStack {
    pub fn new(reserve_size: usize, commit_size: usize, max_depth: u32) -> Result<Self> {
        let config = ArenaConfig::default().reserve_size(reserve_size).commit_size(commit_size);
        Self::with_config(&config, max_depth)
    }

    pub fn with_config(config: &ArenaConfig, max_depth: u32) -> Result<Self> {
        if max_depth == 0 {
            return Err(Error::Zero { what: "stack depth" });
        }
        if max_depth > MAX_STACK_DEPTH {
            return Err(Error::TooLarge {
                what: "stack depth",
                requested: max_depth as usize,
                max: MAX_STACK_DEPTH as usize,
            });
        }

        let header_bytes =
            mem::size_of::<StackHeader>() + max_depth as usize * mem::size_of::<usize>();
        let header = arena::create(header_bytes, config)?.cast::<StackHeader>();

        unsafe {
            let header = header.as_ptr();
            (&raw mut (*header).depth).write(0);
            (&raw mut (*header).max_depth).write(max_depth);
        }

        Ok(Self { header })
    }

    fn saved(&mut self) -> &mut [usize] {
        unsafe {
            let max_depth = self.header.as_ref().max_depth as usize;
            let first = self.header.as_ptr().add(1).cast::<usize>();
            std::slice::from_raw_parts_mut(first, max_depth)
        }
    }

    /// Saves the current position and returns the arena to allocate from.
    /// `None` when the stack is already `max_depth` deep.
    pub fn push(&mut self) -> Option<&mut ArenaCursor> {
        let (depth, max_depth, pos) = {
            let header = unsafe { self.header.as_ref() };
            (header.depth, header.max_depth, header.cursor.used())
        };
        if !contract!(depth < max_depth, "arena stack overflow") {
            return None;
        }

        self.saved()[depth as usize] = pos;

        unsafe { self.header.as_mut().depth += 1 };
        Some(self.arena())
    }

    /// Restores the position saved by the matching [`ArenaStack::push`].
    /// Returns `false` when there is nothing to pop.
    pub fn pop(&mut self) -> bool {
        let depth = unsafe { self.header.as_ref().depth };
        if !contract!(depth > 0, "arena stack underflow") {
            return false;
        }

        let pos = self.saved()[depth as usize - 1];

        unsafe { self.header.as_mut().depth -= 1 };
        self.arena().set_pos(pos);
        true
    }

    pub fn depth(&self) -> u32 {
        unsafe { self.header.as_ref().depth }
    }

    pub fn max_depth(&self) -> u32 {
        unsafe { self.header.as_ref().max_depth }
    }

    /// The underlying arena, allocations made here outside of any scope are
    /// only discarded by popping an enclosing scope.
    pub fn arena(&mut self) -> &mut ArenaCursor {
        unsafe { ArenaCursor::from_state(self.header.cast()).as_mut() }
    }

    pub fn destroy(self) -> Result<(), VmError> {
        let this = ManuallyDrop::new(self);
        unsafe { arena::destroy(this.header.cast()) }
    }
}

impl Drop for ArenaStack {
    fn drop(&mut self) {
        if let Err(err) = unsafe { arena::destroy(self.header.cast()) } {
            warn!("arena stack destroy failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::tests::HANDLER_LOCK;

    #[test]
    fn nested_scopes_unwind_in_order() {
        let mut stack = ArenaStack::new(1 << 20, 0, 4).unwrap();

        let a = stack.push().unwrap().alloc(32).unwrap();
        let b = stack.push().unwrap().alloc(64).unwrap();
        stack.push().unwrap().alloc(128).unwrap();
        assert_eq!(3, stack.depth());
        assert_eq!(32 + 64 + 128, stack.arena().used());

        assert!(stack.pop());
        assert_eq!(32 + 64, stack.arena().used());

        assert!(stack.pop());
        assert_eq!(b, stack.arena().alloc(64).unwrap());

        assert!(stack.pop());
        assert_eq!(0, stack.depth());
        assert_eq!(a, stack.arena().alloc(32).unwrap());
    }

    #[test]
    fn depth_is_bounded() {
        let _guard = HANDLER_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let mut stack = ArenaStack::new(1 << 20, 0, 2).unwrap();
        assert!(stack.push().is_some());
        assert!(stack.push().is_some());
        assert!(stack.push().is_none());

        assert!(stack.pop());
        assert!(stack.pop());
        assert!(!stack.pop());
    }

    #[test]
    fn swapped_stacks_release_their_own_reservation() {
        let mut small = ArenaStack::new(1 << 20, 0, 2).unwrap();
        let mut large = ArenaStack::new(4 << 20, 0, 2).unwrap();
        small.push().unwrap().alloc(16).unwrap();

        mem::swap(&mut small, &mut large);
        assert_eq!(1 << 20, large.arena().reserved_size());
        assert_eq!(16, large.arena().used());
        assert!(large.pop());
        drop(large);

        let ptr = small.push().unwrap().alloc(4096).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAB, 4096) };
        assert_eq!(4 << 20, small.arena().reserved_size());
        assert!(small.destroy().is_ok());
    }

    #[test]
    fn invalid_depths_are_rejected() {
        assert!(matches!(ArenaStack::new(1 << 20, 0, 0), Err(Error::Zero { .. })));
        let too_deep = ArenaStack::new(1 << 20, 0, MAX_STACK_DEPTH + 1);
        assert!(matches!(too_deep, Err(Error::TooLarge { .. })));

        let stack = ArenaStack::new(1 << 20, 0, MAX_STACK_DEPTH).unwrap();
        assert_eq!(MAX_STACK_DEPTH, stack.max_depth());
        assert!(stack.destroy().is_ok());
    }
}
