use std::{ptr::NonNull, sync::OnceLock};

use log::trace;

use crate::{error::VmError, utils::ilog2};

/// Virtual memory page size of the computer. This is usually 4096, 16384 on
/// Apple Silicon. We can't know it at compile time so it is queried once and
/// cached for the whole process.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The allocator's view of the operating system. Everything above this layer
/// (arenas, bins, bindexes) only ever talks to the kernel through the
/// wrappers at the bottom of this file.
pub(crate) struct Kernel;

/// This trait provides an abstraction over the virtual memory lifecycle of the
/// platform. An address range goes through the following states:
///
/// ```text
///             reserve             commit
///  (nothing) ---------> Reserved ---------> Committed
///      ^                 |   ^                  |
///      |     release     |   |     decommit     |
///      +-----------------+   +------------------+
/// ```
///
/// Reserved memory is address space only, touching it faults. Committed
/// memory is backed by (lazily zeroed) physical pages.
trait PlatformMemory {
    /// Claims `len` bytes of address space without backing it with memory.
    unsafe fn reserve(len: usize) -> Result<NonNull<u8>, VmError>;

    /// Backs `len` bytes starting at `addr` with readable and writable memory.
    /// The range must be inside a reservation.
    unsafe fn commit(addr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Returns the physical pages of the range to the OS while keeping the
    /// address space reserved. The range may mix committed and uncommitted
    /// pages.
    unsafe fn decommit(addr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Returns the whole reservation starting at `addr` to the OS.
    unsafe fn release(addr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};
    use crate::error::VmError;

    use libc::{mmap, mprotect, munmap, madvise, off_t, size_t};

    use std::{io, os::raw::{c_int, c_void}, ptr::NonNull};

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Result<NonNull<u8>, VmError> {
            // mmap parameters. No access at all until a range is committed.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => Err(VmError::Reserve {
                        size: len,
                        source: io::Error::last_os_error(),
                    }),
                    addr => NonNull::new(addr.cast::<u8>()).ok_or_else(|| VmError::Reserve {
                        size: len,
                        source: io::Error::other("mmap returned a null mapping"),
                    }),
                }
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe {
                if mprotect(addr.as_ptr().cast(), len as size_t, PROT) != 0 {
                    return Err(VmError::Commit { size: len, source: io::Error::last_os_error() });
                }
            }

            Ok(())
        }

        unsafe fn decommit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            unsafe {
                // Drop the pages first, then make the range inaccessible again so
                // stray accesses fault instead of silently re-committing.
                if madvise(addr.as_ptr().cast(), len as size_t, libc::MADV_DONTNEED) != 0
                    || mprotect(addr.as_ptr().cast(), len as size_t, libc::PROT_NONE) != 0
                {
                    return Err(VmError::Decommit { size: len, source: io::Error::last_os_error() });
                }
            }

            Ok(())
        }

        unsafe fn release(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            unsafe {
                if munmap(addr.as_ptr().cast(), len as size_t) != 0 {
                    return Err(VmError::Release { size: len, source: io::Error::last_os_error() });
                }
            }

            Ok(())
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::{error::VmError, kernel::{Kernel, PlatformMemory}};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Result<NonNull<u8>, VmError> {
            unsafe {
                let addr =
                    Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast()).ok_or_else(|| VmError::Reserve {
                    size: len,
                    source: io::Error::last_os_error(),
                })
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            unsafe {
                let result = Memory::VirtualAlloc(
                    Some(addr.as_ptr() as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                if result.is_null() {
                    return Err(VmError::Commit { size: len, source: io::Error::last_os_error() });
                }
            }

            Ok(())
        }

        unsafe fn decommit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // VirtualFree accepts a range that mixes committed and uncommitted pages.
            unsafe {
                Memory::VirtualFree(addr.as_ptr() as *mut c_void, len, Memory::MEM_DECOMMIT)
                    .map_err(|_| VmError::Decommit {
                        size: len,
                        source: io::Error::last_os_error(),
                    })
            }
        }

        unsafe fn release(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // MEM_RELEASE wants a size of 0 and always frees the whole reservation.
            unsafe {
                Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE)
                    .map_err(|_| VmError::Release { size: len, source: io::Error::last_os_error() })
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// Returns the page size of the computer, querying the OS only the first time.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

/// `log2(page_size())`, page sizes are always a power of two.
#[inline]
pub fn page_size_shift() -> u8 {
    ilog2(page_size()) as u8
}

/// Wrapper to use [`PlatformMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(len: usize) -> Result<NonNull<u8>, VmError> {
    trace!("reserve {len} bytes");
    unsafe { Kernel::reserve(len) }
}

/// Wrapper to use [`PlatformMemory::commit`]. Committing zero bytes is a no-op.
#[inline]
pub(crate) unsafe fn commit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
    if len == 0 {
        return Ok(());
    }
    trace!("commit {len} bytes at {addr:?}");
    unsafe { Kernel::commit(addr, len) }
}

/// Wrapper to use [`PlatformMemory::decommit`]. Decommitting zero bytes is a no-op.
#[inline]
pub(crate) unsafe fn decommit(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
    if len == 0 {
        return Ok(());
    }
    trace!("decommit {len} bytes at {addr:?}");
    unsafe { Kernel::decommit(addr, len) }
}

/// Wrapper to use [`PlatformMemory::release`].
#[inline]
pub(crate) unsafe fn release(addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
    trace!("release {len} bytes at {addr:?}");
    unsafe { Kernel::release(addr, len) }
}
