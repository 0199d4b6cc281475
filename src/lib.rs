//! Move a running executable's own machine code onto 2MiB huge pages.
//!
//! Call [`map_static_code_to_large_pages`] once, early in `main`, before other
//! threads start. On success the code runs from huge pages and needs far fewer
//! TLB entries; on any failure it keeps running from regular pages.
//!
//! Linking: the remap routine is placed in the `hugetext_stub` section, which
//! the linker keeps after `.text` and aligns to 2MiB. On Linux the start of the
//! text is taken from `__hugetext_text_start`, a symbol the embedding binary's
//! linker script defines at the start of `.text`; enable the
//! `text-start-marker` feature once it does. libc must be linked dynamically.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("hugetext supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod large_pages;

// entry point/status
pub use large_pages::manager::map_static_code_to_large_pages;
pub use large_pages::status::{large_pages_error, StatusCode};

// region math
pub use large_pages::align::{align_down, align_up, HUGE_PAGE_SIZE};
pub use large_pages::region::TextRegion;

// config/stats
pub use large_pages::config::{LargePagesMode, ParseModeError, LARGE_PAGES_ENV};
pub use large_pages::stats::{large_pages_stats, LargePagesStats};

// errors
pub use large_pages::vm::VmError;
