//! The copy-and-remap critical section.
//!
//! While [`move_region`] runs, the pages it moves are, for a while, either
//! unmapped or zero-filled. Everything executed in that window must therefore
//! live outside the moved range:
//!
//! - the routine itself is placed in its own section (`hugetext_stub` on ELF,
//!   `__TEXT,__hugetext` on Mach-O) which the region locator excludes;
//! - every helper it reaches is `#[inline(always)]` or a C library symbol
//!   (`mmap`, `munmap`, `mprotect`, `madvise`, `memcpy`, errno), resolved
//!   through the GOT into the shared libc;
//! - it uses no `?`, closures, formatting or logging. Failures come back as a
//!   [`RemapFailure`] and are rendered by the caller.
//!
//! A statically linked libc would put `memcpy` and friends inside the moved
//! text. Such builds must not enable `large-pages`.

use super::vm::{Protection, RemapFailure, RemapStep, VmOps};

/// Move `[from, from + size)` onto a fresh, huge-page backed mapping at the
/// same address, keeping the bytes and ending up read+execute.
///
/// Once the new mapping has replaced the original pages, a failure never
/// unmaps it: the scratch copy is written back and the range is downgraded to
/// read+execute on a best-effort basis, so the code stays intact on standard
/// pages.
///
/// # Safety
///
/// - `from` and `size` are huge-page aligned and `[from, from + size)` is a
///   live mapping with at least read access.
/// - No code executes inside the range (on any thread) until this returns.
/// - Must be expanded into a caller that itself lives outside the range.
#[inline(always)]
pub(crate) unsafe fn move_region<O: VmOps>(from: usize, size: usize) -> Result<(), RemapFailure> {
    // Safety: upheld by caller for every call below.
    unsafe {
        let scratch = match O::map_scratch(size) {
            Ok(addr) => addr,
            Err(errno) => {
                return Err(RemapFailure {
                    step: RemapStep::Scratch,
                    errno,
                })
            }
        };

        O::copy(scratch, from, size);

        let fixed = match O::map_fixed(from, size) {
            Ok(addr) => addr,
            Err(errno) => {
                let _ = O::unmap(scratch, size);
                return Err(RemapFailure {
                    step: RemapStep::Fixed,
                    errno,
                });
            }
        };
        let detached = fixed != from;

        if let Err(errno) = O::advise_huge(fixed, size) {
            return Err(roll_back::<O>(from, scratch, fixed, size, RemapStep::Advise, errno));
        }

        if detached {
            // The platform only honoured the address as a hint: stage the code
            // in the huge-page mapping and patch the original pages in place.
            O::copy(fixed, scratch, size);
        }

        if O::WIDEN_AFTER_MAP {
            if let Err(errno) = O::protect(from, size, Protection::ReadWriteExec) {
                return Err(roll_back::<O>(from, scratch, fixed, size, RemapStep::Widen, errno));
            }
        }

        O::copy(from, scratch, size);

        if let Err(errno) = O::protect(from, size, Protection::ReadExec) {
            return Err(roll_back::<O>(from, scratch, fixed, size, RemapStep::Protect, errno));
        }

        if detached {
            let _ = O::unmap(fixed, size);
        }
        let _ = O::unmap(scratch, size);
        Ok(())
    }
}

#[inline(always)]
unsafe fn roll_back<O: VmOps>(
    from: usize,
    scratch: usize,
    fixed: usize,
    size: usize,
    step: RemapStep,
    errno: i32,
) -> RemapFailure {
    // Safety: same contract as `move_region`.
    unsafe {
        if fixed == from {
            // The original pages are gone; the scratch copy is the only code
            // left. The fixed mapping was created writable.
            O::copy(from, scratch, size);
            let _ = O::protect(from, size, Protection::ReadExec);
        } else {
            let _ = O::unmap(fixed, size);
        }
        let _ = O::unmap(scratch, size);
    }
    RemapFailure { step, errno }
}

#[cfg(all(
    feature = "large-pages",
    any(target_os = "linux", target_os = "freebsd", target_os = "macos")
))]
pub(crate) use stub::*;

#[cfg(all(
    feature = "large-pages",
    any(target_os = "linux", target_os = "freebsd", target_os = "macos")
))]
mod stub {
    use super::super::vm::{PlatformVmOps, RemapFailure};
    use super::move_region;

    // Raise the section's alignment to the huge page size so the text region
    // ends exactly where the stub begins.
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    std::arch::global_asm!(
        ".pushsection hugetext_stub,\"ax\",%progbits",
        ".balign 0x200000",
        ".popsection",
    );

    /// Production remap routine: [`move_region`] over the platform's VM calls,
    /// linked outside `.text`.
    ///
    /// # Safety
    ///
    /// See [`move_region`].
    #[inline(never)]
    #[cfg_attr(
        any(target_os = "linux", target_os = "freebsd"),
        link_section = "hugetext_stub"
    )]
    #[cfg_attr(
        target_os = "macos",
        link_section = "__TEXT,__hugetext,regular,pure_instructions"
    )]
    pub(crate) unsafe fn move_text_region_to_large_pages(
        from: usize,
        size: usize,
    ) -> Result<(), RemapFailure> {
        // Safety: forwarded from caller.
        unsafe { move_region::<PlatformVmOps>(from, size) }
    }

    /// Address of the remap routine's machine code.
    #[must_use]
    pub(crate) fn stub_address() -> usize {
        move_text_region_to_large_pages as usize
    }

    /// `[start, stop)` of the stub section, from the linker's `__start_`/
    /// `__stop_` symbols.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub(crate) fn stub_section() -> (usize, usize) {
        extern "C" {
            static __start_hugetext_stub: u8;
            static __stop_hugetext_stub: u8;
        }
        // Safety: only the addresses of the linker-defined symbols are taken.
        unsafe {
            (
                std::ptr::addr_of!(__start_hugetext_stub) as usize,
                std::ptr::addr_of!(__stop_hugetext_stub) as usize,
            )
        }
    }

    /// Start-of-text marker, defined by the embedding binary's linker script.
    #[cfg(all(target_os = "linux", feature = "text-start-marker"))]
    #[must_use]
    pub(crate) fn text_start_marker() -> Option<usize> {
        extern "C" {
            static __hugetext_text_start: u8;
        }
        // Safety: only the address of the linker-defined symbol is taken.
        Some(unsafe { std::ptr::addr_of!(__hugetext_text_start) as usize })
    }

    /// Binaries that do not define the marker cannot locate their text.
    #[cfg(all(target_os = "linux", not(feature = "text-start-marker")))]
    #[must_use]
    pub(crate) fn text_start_marker() -> Option<usize> {
        None
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        MapScratch,
        MapFixed(usize),
        Advise(usize),
        Protect(usize, Protection),
        Unmap(usize),
        Copy { dst: usize, src: usize },
    }

    thread_local! {
        static CALLS: RefCell<Vec<Call>> = const { RefCell::new(Vec::new()) };
        static FAIL_AT: Cell<Option<RemapStep>> = const { Cell::new(None) };
        static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
        static STAGING: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    }

    /// Mapping-call spy over heap buffers.
    ///
    /// `DETACHED = false` behaves like Linux/FreeBSD (the new mapping replaces
    /// the text in place and comes up zero-filled); `DETACHED = true` behaves
    /// like XNU (the new mapping lands elsewhere and write access to the text
    /// is granted with a separate protection change).
    struct SpyOps<const DETACHED: bool>;

    fn reset_spy(fail_at: Option<RemapStep>) {
        CALLS.with(|c| c.borrow_mut().clear());
        FAIL_AT.with(|f| f.set(fail_at));
    }

    fn spy_calls() -> Vec<Call> {
        CALLS.with(|c| c.borrow().clone())
    }

    fn record(call: Call) {
        CALLS.with(|c| c.borrow_mut().push(call));
    }

    fn fails(step: RemapStep) -> bool {
        FAIL_AT.with(|f| f.get() == Some(step))
    }

    impl<const DETACHED: bool> VmOps for SpyOps<DETACHED> {
        const WIDEN_AFTER_MAP: bool = DETACHED;

        unsafe fn map_scratch(size: usize) -> Result<usize, i32> {
            record(Call::MapScratch);
            if fails(RemapStep::Scratch) {
                return Err(libc::ENOMEM);
            }
            Ok(SCRATCH.with(|s| {
                let mut s = s.borrow_mut();
                *s = vec![0; size];
                s.as_mut_ptr() as usize
            }))
        }

        unsafe fn map_fixed(addr: usize, size: usize) -> Result<usize, i32> {
            record(Call::MapFixed(addr));
            if fails(RemapStep::Fixed) {
                return Err(libc::EINVAL);
            }
            if DETACHED {
                Ok(STAGING.with(|s| {
                    let mut s = s.borrow_mut();
                    *s = vec![0; size];
                    s.as_mut_ptr() as usize
                }))
            } else {
                // Fresh anonymous memory replaces the text.
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
                Ok(addr)
            }
        }

        unsafe fn advise_huge(addr: usize, _size: usize) -> Result<(), i32> {
            record(Call::Advise(addr));
            if fails(RemapStep::Advise) {
                return Err(libc::EINVAL);
            }
            Ok(())
        }

        unsafe fn protect(addr: usize, _size: usize, prot: Protection) -> Result<(), i32> {
            record(Call::Protect(addr, prot));
            let step = match prot {
                Protection::ReadWriteExec => RemapStep::Widen,
                Protection::ReadExec => RemapStep::Protect,
            };
            if fails(step) {
                return Err(libc::EACCES);
            }
            Ok(())
        }

        unsafe fn unmap(addr: usize, _size: usize) -> Result<(), i32> {
            record(Call::Unmap(addr));
            Ok(())
        }

        unsafe fn copy(dst: usize, src: usize, size: usize) {
            record(Call::Copy { dst, src });
            unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size) };
        }
    }

    fn text_image(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn scratch_addr() -> usize {
        SCRATCH.with(|s| s.borrow().as_ptr() as usize)
    }

    fn staging_addr() -> usize {
        STAGING.with(|s| s.borrow().as_ptr() as usize)
    }

    fn count(calls: &[Call], wanted: Call) -> usize {
        calls.iter().filter(|&&c| c == wanted).count()
    }

    #[test]
    fn test_move_region_in_place_success() {
        reset_spy(None);
        let mut text = text_image(4096);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<false>>(from, text.len()) };
        assert_eq!(result, Ok(()));
        assert_eq!(text, snapshot, "content must survive the move");

        let scratch = scratch_addr();
        assert_eq!(
            spy_calls(),
            vec![
                Call::MapScratch,
                Call::Copy { dst: scratch, src: from },
                Call::MapFixed(from),
                Call::Advise(from),
                Call::Copy { dst: from, src: scratch },
                Call::Protect(from, Protection::ReadExec),
                Call::Unmap(scratch),
            ]
        );
    }

    #[test]
    fn test_scratch_failure_touches_nothing() {
        reset_spy(Some(RemapStep::Scratch));
        let mut text = text_image(512);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<false>>(from, text.len()) };
        assert_eq!(
            result,
            Err(RemapFailure {
                step: RemapStep::Scratch,
                errno: libc::ENOMEM
            })
        );
        assert_eq!(spy_calls(), vec![Call::MapScratch]);
        assert_eq!(text, snapshot);
    }

    #[test]
    fn test_fixed_failure_releases_scratch() {
        reset_spy(Some(RemapStep::Fixed));
        let mut text = text_image(1024);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<false>>(from, text.len()) };
        assert_eq!(result.map_err(|f| f.step), Err(RemapStep::Fixed));

        let calls = spy_calls();
        assert_eq!(count(&calls, Call::Unmap(scratch_addr())), 1, "{calls:?}");
        assert_eq!(calls.last(), Some(&Call::Unmap(scratch_addr())));
        assert!(!calls.iter().any(|c| matches!(c, Call::Protect(..))));
        assert_eq!(text, snapshot);
    }

    #[test]
    fn test_advice_failure_restores_code_in_place() {
        reset_spy(Some(RemapStep::Advise));
        let mut text = text_image(2048);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<false>>(from, text.len()) };
        assert_eq!(result.map_err(|f| f.step), Err(RemapStep::Advise));
        assert_eq!(text, snapshot, "scratch copy must be written back");

        let calls = spy_calls();
        assert_eq!(count(&calls, Call::Unmap(from)), 0, "text must stay mapped");
        assert_eq!(count(&calls, Call::Unmap(scratch_addr())), 1);
        assert_eq!(count(&calls, Call::Protect(from, Protection::ReadExec)), 1);
    }

    #[test]
    fn test_protect_failure_keeps_code_and_releases_scratch() {
        reset_spy(Some(RemapStep::Protect));
        let mut text = text_image(2048);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<false>>(from, text.len()) };
        assert_eq!(result.map_err(|f| f.step), Err(RemapStep::Protect));
        assert_eq!(text, snapshot);

        let calls = spy_calls();
        assert_eq!(count(&calls, Call::Unmap(from)), 0);
        assert_eq!(count(&calls, Call::Unmap(scratch_addr())), 1);
    }

    #[test]
    fn test_detached_mapping_success() {
        reset_spy(None);
        let mut text = text_image(4096);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<true>>(from, text.len()) };
        assert_eq!(result, Ok(()));
        assert_eq!(text, snapshot);

        let (scratch, staging) = (scratch_addr(), staging_addr());
        assert_eq!(
            spy_calls(),
            vec![
                Call::MapScratch,
                Call::Copy { dst: scratch, src: from },
                Call::MapFixed(from),
                Call::Advise(staging),
                Call::Copy { dst: staging, src: scratch },
                Call::Protect(from, Protection::ReadWriteExec),
                Call::Copy { dst: from, src: scratch },
                Call::Protect(from, Protection::ReadExec),
                Call::Unmap(staging),
                Call::Unmap(scratch),
            ]
        );
    }

    #[test]
    fn test_detached_widen_failure_unmaps_both_mappings() {
        reset_spy(Some(RemapStep::Widen));
        let mut text = text_image(4096);
        let snapshot = text.clone();
        let from = text.as_mut_ptr() as usize;

        let result = unsafe { move_region::<SpyOps<true>>(from, text.len()) };
        assert_eq!(result.map_err(|f| f.step), Err(RemapStep::Widen));
        assert_eq!(text, snapshot);

        let calls = spy_calls();
        assert_eq!(count(&calls, Call::Unmap(staging_addr())), 1);
        assert_eq!(count(&calls, Call::Unmap(scratch_addr())), 1);
        assert_eq!(count(&calls, Call::Unmap(from)), 0);
        assert!(!calls.contains(&Call::Copy {
            dst: from,
            src: scratch_addr()
        }));
    }
}
