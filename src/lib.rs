//! Virtual memory backed allocators.
//!
//! Everything in this crate starts from the same idea: reserve a large range
//! of address space up front and only commit pages as they are needed. Nothing
//! ever moves, so pointers stay valid for the lifetime of the allocator.
//!
//! - [`Arena`]: bump allocator with save points, shrink and reset.
//! - [`ArenaStack`]: arena with a bounded stack of nested scopes.
//! - [`Region`]: one reservation sliced into many independent arenas.
//! - [`Binmap`]: 1 to 4 level bitmap with O(levels) free bit search.
//! - [`Duomap`]: a binmap that also finds used bits, with pivot searches.
//! - [`Bin`] / [`Bin16`]: same-size item pools with stable indices.
//! - [`Bindex`]: dense same-size item pool, swap on free.
//!
//! None of the allocators are synchronized, use one per thread or wrap them.
//! Misuse (freeing foreign pointers, out of range bits) is reported through
//! the assert handler in [`debug`] and otherwise ignored.

pub mod debug;

mod allocator;
mod arena;
mod bin;
mod bindex;
mod binmap;
mod duomap;
mod error;
mod kernel;
mod region;
mod stack;
mod utils;

pub use allocator::Allocator;
pub use arena::{
    Arena, ArenaConfig, ArenaCursor, DEFAULT_ALIGNMENT_SHIFT, DEFAULT_RESERVE_SIZE,
    MAX_ALIGNMENT_SHIFT, SavePoint, Scratch,
};
pub use bin::{Bin, Bin16, BinClass, Narrow, RawBin, SlotIndex, Wide};
pub use bindex::{Bindex, MAX_BINDEX_ITEMS, Removal};
pub use binmap::{Binmap, BinmapLayout, MAX_BITS, MAX_LEVELS, Words};
pub use duomap::Duomap;
pub use error::{Error, Result, VmError};
pub use kernel::{page_size, page_size_shift};
pub use region::{MAX_REGION_ARENAS, Region};
pub use stack::{ArenaStack, MAX_STACK_DEPTH};
pub use utils::{align_down, align_up, ilog2, is_pow2};
