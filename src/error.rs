use std::io;

use thiserror::Error;

/// A virtual memory syscall was denied by the kernel.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to reserve {size} bytes of address space: {source}")]
    Reserve { size: usize, source: io::Error },
    #[error("failed to commit {size} bytes: {source}")]
    Commit { size: usize, source: io::Error },
    #[error("failed to decommit {size} bytes: {source}")]
    Decommit { size: usize, source: io::Error },
    #[error("failed to release {size} bytes of address space: {source}")]
    Release { size: usize, source: io::Error },
}

/// Errors returned when building an allocator or addressing one of its items.
///
/// Allocation itself never returns this: running out of capacity or being
/// refused a commit is reported as `None`, see the individual `alloc` methods.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("alignment shift {shift} is not supported (maximum {max})")]
    InvalidAlignment { shift: u8, max: u8 },
    #[error("{what} of {requested} exceeds the supported maximum of {max}")]
    TooLarge { what: &'static str, requested: usize, max: usize },
    #[error("{what} must not be zero")]
    Zero { what: &'static str },
    #[error("index {index} is out of range (live items: {len})")]
    IndexOutOfRange { index: u32, len: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
