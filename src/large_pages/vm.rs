use std::fmt;
use std::io;

#[derive(Debug)]
pub enum VmError {
    ScratchMappingFailed(io::Error),
    FixedMappingFailed(io::Error),
    HugePageAdviceFailed(io::Error),
    WidenProtectionFailed(io::Error),
    ProtectionFailed(io::Error),
    /// The text region starts below the remap routine, so moving it could
    /// pull the routine out from under itself.
    StubInsideRegion { stub: usize, from: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ScratchMappingFailed(e) => write!(f, "scratch mapping failed: {e}"),
            VmError::FixedMappingFailed(e) => write!(f, "fixed-address mapping failed: {e}"),
            VmError::HugePageAdviceFailed(e) => write!(f, "huge page advice failed: {e}"),
            VmError::WidenProtectionFailed(e) => {
                write!(f, "making text writable failed: {e}")
            }
            VmError::ProtectionFailed(e) => {
                write!(f, "restoring read+execute protection failed: {e}")
            }
            VmError::StubInsideRegion { stub, from } => write!(
                f,
                "text region at {from:#x} starts below the remap routine at {stub:#x}"
            ),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ScratchMappingFailed(e)
            | VmError::FixedMappingFailed(e)
            | VmError::HugePageAdviceFailed(e)
            | VmError::WidenProtectionFailed(e)
            | VmError::ProtectionFailed(e) => Some(e),
            VmError::StubInsideRegion { .. } => None,
        }
    }
}

/// Step of the move that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemapStep {
    Scratch,
    Fixed,
    Advise,
    Widen,
    Protect,
}

/// Failure report of the remap routine.
///
/// Plain `Copy` data: the routine cannot build an `io::Error` (or call anything
/// else that lives in the text being moved), so the rich error is assembled
/// by the caller once the text is back in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemapFailure {
    pub(crate) step: RemapStep,
    pub(crate) errno: i32,
}

impl From<RemapFailure> for VmError {
    fn from(failure: RemapFailure) -> Self {
        let e = io::Error::from_raw_os_error(failure.errno);
        match failure.step {
            RemapStep::Scratch => VmError::ScratchMappingFailed(e),
            RemapStep::Fixed => VmError::FixedMappingFailed(e),
            RemapStep::Advise => VmError::HugePageAdviceFailed(e),
            RemapStep::Widen => VmError::WidenProtectionFailed(e),
            RemapStep::Protect => VmError::ProtectionFailed(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    ReadWriteExec,
    ReadExec,
}

/// Virtual memory operations the remap routine is built from.
///
/// Addresses are plain `usize` and errors are raw errno values. Platform
/// implementations must be `#[inline(always)]` and call nothing but C library
/// symbols: they are expanded inside the remap routine while the text they
/// were compiled from may be unmapped.
pub(crate) trait VmOps {
    /// Write access to the new mapping at the text address is granted by a
    /// separate `protect` call instead of at creation time.
    const WIDEN_AFTER_MAP: bool;

    /// Private anonymous read+write mapping anywhere in the address space.
    unsafe fn map_scratch(size: usize) -> Result<usize, i32>;

    /// Anonymous read+write+execute mapping at (or, where the platform cannot
    /// pin it, near) `addr`. Returns the address actually mapped.
    unsafe fn map_fixed(addr: usize, size: usize) -> Result<usize, i32>;

    /// Ask the OS to back `[addr, addr + size)` with huge pages.
    unsafe fn advise_huge(addr: usize, size: usize) -> Result<(), i32>;

    unsafe fn protect(addr: usize, size: usize, prot: Protection) -> Result<(), i32>;

    unsafe fn unmap(addr: usize, size: usize) -> Result<(), i32>;

    /// Non-overlapping byte copy.
    unsafe fn copy(dst: usize, src: usize, size: usize);
}

#[cfg(all(
    feature = "large-pages",
    any(target_os = "linux", target_os = "freebsd", target_os = "macos")
))]
pub(crate) struct PlatformVmOps;

#[cfg(all(
    feature = "large-pages",
    any(target_os = "linux", target_os = "freebsd", target_os = "macos")
))]
mod unix {
    use super::{PlatformVmOps, Protection, VmOps};

    // Only the null pointer literal is used to build the `mmap` address
    // argument; `ptr::null_mut` is a function and may not be inlined in debug
    // builds.
    #[allow(clippy::zero_ptr)]
    const ANYWHERE: *mut libc::c_void = 0 as *mut libc::c_void;

    #[cfg(target_os = "linux")]
    #[inline(always)]
    unsafe fn errno() -> i32 {
        // Safety: the thread's errno slot is always valid.
        unsafe { *libc::__errno_location() }
    }

    #[cfg(any(target_os = "freebsd", target_os = "macos"))]
    #[inline(always)]
    unsafe fn errno() -> i32 {
        // Safety: the thread's errno slot is always valid.
        unsafe { *libc::__error() }
    }

    #[inline(always)]
    fn prot_bits(prot: Protection) -> libc::c_int {
        match prot {
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        }
    }

    #[inline(always)]
    unsafe fn checked_mmap(
        addr: *mut libc::c_void,
        size: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
    ) -> Result<usize, i32> {
        // Safety: FFI call to mmap.
        let ptr = unsafe { libc::mmap(addr, size, prot, flags, fd, 0) };
        if ptr as usize == libc::MAP_FAILED as usize {
            // Safety: read right after the failing call.
            return Err(unsafe { errno() });
        }
        Ok(ptr as usize)
    }

    #[inline(always)]
    fn check(ret: libc::c_int) -> Result<(), i32> {
        if ret == 0 {
            Ok(())
        } else {
            // Safety: read right after the failing call.
            Err(unsafe { errno() })
        }
    }

    /// FreeBSD: align the mapping to the superpage size so the pmap can
    /// promote it. `MAP_ALIGNED(n)` is `n << 24`; `MAP_ALIGNED_SUPER` is `1`.
    #[cfg(target_os = "freebsd")]
    const MAP_ALIGNED_SUPER: libc::c_int = 1 << 24;

    /// XNU: superpage size selector passed in the `fd` argument of an
    /// anonymous mapping. `SUPERPAGE_SIZE_2MB` (2) << `VM_FLAGS_SUPERPAGE_SHIFT` (16).
    #[cfg(target_os = "macos")]
    const VM_FLAGS_SUPERPAGE_SIZE_2MB: libc::c_int = 2 << 16;

    impl VmOps for PlatformVmOps {
        // XNU will not hand out a writable+executable mapping on top of live
        // text; write access is added to the original pages afterwards.
        const WIDEN_AFTER_MAP: bool = cfg!(target_os = "macos");

        #[inline(always)]
        unsafe fn map_scratch(size: usize) -> Result<usize, i32> {
            // Safety: anonymous mapping, no existing memory is touched.
            unsafe {
                checked_mmap(
                    ANYWHERE,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                )
            }
        }

        #[cfg(target_os = "linux")]
        #[inline(always)]
        unsafe fn map_fixed(addr: usize, size: usize) -> Result<usize, i32> {
            // We already know the original pages are r-xp. Write is needed to
            // install the copy; MAP_FIXED replaces the text in place.
            // Safety: caller owns `[addr, addr + size)` for the duration.
            unsafe {
                checked_mmap(
                    addr as *mut libc::c_void,
                    size,
                    prot_bits(Protection::ReadWriteExec),
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                    -1,
                )
            }
        }

        #[cfg(target_os = "freebsd")]
        #[inline(always)]
        unsafe fn map_fixed(addr: usize, size: usize) -> Result<usize, i32> {
            // Safety: caller owns `[addr, addr + size)` for the duration.
            unsafe {
                checked_mmap(
                    addr as *mut libc::c_void,
                    size,
                    prot_bits(Protection::ReadWriteExec),
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED | MAP_ALIGNED_SUPER,
                    -1,
                )
            }
        }

        #[cfg(target_os = "macos")]
        #[inline(always)]
        unsafe fn map_fixed(addr: usize, size: usize) -> Result<usize, i32> {
            // There is no room to force the mapping onto the live text, so
            // `addr` is only a hint.
            // Safety: without MAP_FIXED no existing mapping is replaced.
            unsafe {
                checked_mmap(
                    addr as *mut libc::c_void,
                    size,
                    prot_bits(Protection::ReadWriteExec),
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    VM_FLAGS_SUPERPAGE_SIZE_2MB,
                )
            }
        }

        #[cfg(target_os = "linux")]
        #[inline(always)]
        unsafe fn advise_huge(addr: usize, size: usize) -> Result<(), i32> {
            // Safety: FFI call to madvise.
            check(unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_HUGEPAGE) })
        }

        // FreeBSD and XNU pick the page size when the mapping is created.
        #[cfg(not(target_os = "linux"))]
        #[inline(always)]
        unsafe fn advise_huge(_addr: usize, _size: usize) -> Result<(), i32> {
            Ok(())
        }

        #[inline(always)]
        unsafe fn protect(addr: usize, size: usize, prot: Protection) -> Result<(), i32> {
            // Safety: FFI call to mprotect.
            check(unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot_bits(prot)) })
        }

        #[inline(always)]
        unsafe fn unmap(addr: usize, size: usize) -> Result<(), i32> {
            // Safety: FFI call to munmap.
            check(unsafe { libc::munmap(addr as *mut libc::c_void, size) })
        }

        #[inline(always)]
        unsafe fn copy(dst: usize, src: usize, size: usize) {
            // libc's memcpy rather than `ptr::copy_nonoverlapping`: the latter
            // runs precondition checks from this binary's text in debug builds.
            // Safety: caller guarantees both ranges are mapped and disjoint.
            unsafe {
                libc::memcpy(
                    dst as *mut libc::c_void,
                    src as *const libc::c_void,
                    size,
                );
            }
        }
    }
}
