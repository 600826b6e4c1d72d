//! This file contains the numeric and memory helpers shared by every allocator
//! in the crate. These are functions that don't particularly belong to any
//! concrete module of the program.

use std::ptr::NonNull;

/// It aligns `to_be_aligned` up to a multiple of `alignment`.
///
/// This is used to round reservation sizes up to whole pages and bump
/// positions up to the alignment of a request. `alignment` must be a power
/// of two.
#[inline]
pub const fn align_up(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// It aligns `to_be_aligned` down to a multiple of `alignment`.
#[inline]
pub const fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    to_be_aligned & !(alignment - 1)
}

/// Tells whether `value` is a power of two. Zero is not.
#[inline]
pub const fn is_pow2(value: usize) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Floor of the base 2 logarithm. `ilog2(0)` is defined as 0.
#[inline]
pub const fn ilog2(value: usize) -> u32 {
    if value == 0 { 0 } else { usize::BITS - 1 - value.leading_zeros() }
}

/// Writes `len` bytes at `dst` repeating the little endian bytes of `pattern`.
/// A trailing partial word gets the low bytes of the pattern.
///
/// ## Safety
/// `dst` must be valid for `len` bytes of writes.
pub(crate) unsafe fn fill_pattern(dst: NonNull<u8>, len: usize, pattern: u32) {
    let bytes = pattern.to_le_bytes();

    unsafe {
        if bytes.iter().all(|b| *b == bytes[0]) {
            dst.as_ptr().write_bytes(bytes[0], len);
            return;
        }

        let out = std::slice::from_raw_parts_mut(dst.as_ptr(), len);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = bytes[i & 3];
        }
    }
}
