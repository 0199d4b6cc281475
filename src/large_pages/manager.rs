use super::region::TextRegion;
use super::stats;
use super::status::StatusCode;
use super::vm::{RemapFailure, VmError};
use crate::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// The probe/locate/remap capabilities of one target OS.
///
/// Selected at build time; tests substitute a spy.
pub(crate) trait TextPlatform {
    /// Refuse regions that start below the remap routine (FreeBSD, where the
    /// locator has no end marker to keep the routine out of the region).
    const REJECT_REGION_BELOW_STUB: bool = false;

    fn huge_pages_enabled() -> bool;

    fn find_text_region() -> TextRegion;

    fn stub_address() -> usize;

    /// # Safety
    ///
    /// `region` is found and no other thread executes inside it.
    unsafe fn move_region(region: &TextRegion) -> Result<(), RemapFailure>;
}

/// Probe, locate and move, reporting the first thing that stops us.
pub(crate) fn map_with<P: TextPlatform>() -> StatusCode {
    if !P::huge_pages_enabled() {
        log::debug!("huge pages are not enabled");
        return StatusCode::Disabled;
    }

    let region = P::find_text_region();
    if !region.is_found() {
        log::debug!("no text region large enough for huge pages");
        return StatusCode::RegionNotFound;
    }

    let stub = P::stub_address();
    if P::REJECT_REGION_BELOW_STUB && region.from() < stub {
        log::warn!(
            "{}",
            VmError::StubInsideRegion {
                stub,
                from: region.from()
            }
        );
        return StatusCode::MappingFailure;
    }

    log::debug!(
        "moving text {:#x}..{:#x} onto {} huge pages",
        region.from(),
        region.to(),
        region.total_huge_pages()
    );

    // Safety: the region was found, and invoking this before other threads
    // run code in it is the entry point's documented contract.
    match unsafe { P::move_region(&region) } {
        Ok(()) => {
            stats::REMAPPED_BYTES.add(region.len());
            stats::REMAPPED_HUGE_PAGES.add(region.total_huge_pages());
            StatusCode::Ok
        }
        Err(failure) => {
            log::warn!("{}", VmError::from(failure));
            StatusCode::MappingFailure
        }
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// Runs a status-producing operation at most once and replays its result.
pub(crate) struct OnceStatus {
    state: AtomicU8,
    status: AtomicI32,
}

impl OnceStatus {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            status: AtomicI32::new(0),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            status: AtomicI32::new(0),
        }
    }

    /// Run `op` if nobody has yet; otherwise wait for the first run to finish
    /// and return its status.
    pub(crate) fn get_or_run(&self, op: impl FnOnce() -> StatusCode) -> StatusCode {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            let status = op();
            self.status.store(status.as_raw(), Ordering::Relaxed);
            self.state.store(DONE, Ordering::Release);
            return status;
        }

        while self.state.load(Ordering::Acquire) != DONE {
            crate::sync::thread::yield_now();
        }
        self.recorded().unwrap_or(StatusCode::MappingFailure)
    }

    /// Status of the completed run, if any.
    #[cfg(test)]
    pub(crate) fn get(&self) -> Option<StatusCode> {
        if self.state.load(Ordering::Acquire) == DONE {
            self.recorded()
        } else {
            None
        }
    }

    fn recorded(&self) -> Option<StatusCode> {
        StatusCode::from_raw(self.status.load(Ordering::Relaxed))
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(
        feature = "large-pages",
        any(target_os = "linux", target_os = "freebsd", target_os = "macos")
    ))] {
        pub(crate) struct PlatformText;

        impl TextPlatform for PlatformText {
            const REJECT_REGION_BELOW_STUB: bool = cfg!(target_os = "freebsd");

            fn huge_pages_enabled() -> bool {
                super::probe::huge_pages_enabled()
            }

            fn find_text_region() -> TextRegion {
                super::region::find_text_region()
            }

            fn stub_address() -> usize {
                super::remap::stub_address()
            }

            unsafe fn move_region(region: &TextRegion) -> Result<(), RemapFailure> {
                // Safety: forwarded from caller.
                unsafe { super::remap::move_text_region_to_large_pages(region.from(), region.len()) }
            }
        }

        crate::sync::static_atomic! {
            static FIRST_RUN: OnceStatus = OnceStatus::new();
        }

        fn run_once() -> StatusCode {
            FIRST_RUN.get_or_run(map_with::<PlatformText>)
        }
    } else {
        fn run_once() -> StatusCode {
            StatusCode::NotSupported
        }
    }
}

/// Move this executable's own code onto 2MiB pages.
///
/// Call it once, early during startup, **before** spawning threads that run
/// code of this executable: nothing stops another thread from executing inside
/// the text while it is being moved. The first call does the work; later calls
/// return the first call's status without touching the address space.
///
/// Never aborts the process. Anything other than [`StatusCode::Ok`] means the
/// code keeps running from regular pages, and the reason can be shown with
/// [`StatusCode::description`]. OS errors behind a
/// [`StatusCode::MappingFailure`] are logged through the `log` facade.
///
/// Returns [`StatusCode::NotSupported`] when built without the `large-pages`
/// feature or for a target other than Linux, FreeBSD or macOS.
#[must_use]
pub fn map_static_code_to_large_pages() -> StatusCode {
    run_once()
}
