//! Contract checking for debug builds.
//!
//! The allocators in this crate don't validate their inputs in release builds,
//! misuse (freeing a foreign pointer, touching a bit past `maxbits`, asking for
//! a non power of two alignment) is a contract violation. In debug builds
//! every such violation is routed through a single, replaceable handler so
//! that tests and host applications can decide what happens.
//!
//! The guarded operation always bails out after reporting, the handler only
//! decides whether we additionally panic.

use std::{ptr::NonNull, sync::RwLock};

use log::error;

/// Where and why a contract was violated.
#[derive(Debug, Clone, Copy)]
pub struct AssertInfo<'a> {
    pub file: &'static str,
    pub line: u32,
    pub expr: &'static str,
    pub message: &'a str,
}

/// Returns `true` to break (panic) on the violation, `false` to carry on.
pub type AssertHandler = fn(&AssertInfo<'_>) -> bool;

static HANDLER: RwLock<AssertHandler> = RwLock::new(log_and_continue);

/// Byte written over memory handed back to an arena in debug builds.
pub const POISON: u32 = 0xFEFE_FEFE;

/// The default handler: log the violation and keep going.
pub fn log_and_continue(info: &AssertInfo<'_>) -> bool {
    error!("assert: {}({}): {}; {}", info.file, info.line, info.expr, info.message);
    false
}

/// Handler that always breaks, useful in tests.
pub fn panic_always(_: &AssertInfo<'_>) -> bool {
    true
}

/// Installs `handler` process wide and returns the previous one. `None`
/// restores [`log_and_continue`].
pub fn set_assert_handler(handler: Option<AssertHandler>) -> AssertHandler {
    let mut slot = HANDLER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *slot, handler.unwrap_or(log_and_continue))
}

#[doc(hidden)]
pub fn report(info: &AssertInfo<'_>) -> bool {
    let handler = *HANDLER.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    handler(info)
}

/// Checks `$cond` in debug builds, routing a failure through the assert
/// handler. Evaluates to the condition so callers can bail out:
///
/// ```ignore
/// if !contract!(bit < self.maxbits(), "bit out of range") {
///     return;
/// }
/// ```
///
/// In release builds the condition is still evaluated (it guards memory
/// safety) but nothing is reported.
#[macro_export]
macro_rules! contract {
    ($cond:expr, $msg:expr) => {{
        let ok: bool = $cond;
        #[cfg(debug_assertions)]
        if !ok {
            let info = $crate::debug::AssertInfo {
                file: file!(),
                line: line!(),
                expr: stringify!($cond),
                message: $msg,
            };
            if $crate::debug::report(&info) {
                panic!("contract violated: {} ({})", info.expr, info.message);
            }
        }
        ok
    }};
}

/// Overwrites memory that is being given back in debug builds, so stale reads
/// stand out. Does nothing in release builds.
///
/// ## Safety
/// `addr` must be valid for `len` bytes of writes.
#[inline]
pub(crate) unsafe fn poison(addr: NonNull<u8>, len: usize) {
    #[cfg(debug_assertions)]
    unsafe {
        crate::utils::fill_pattern(addr, len, POISON);
    }
    #[cfg(not(debug_assertions))]
    let _ = (addr, len);
}
