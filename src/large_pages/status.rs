use std::fmt;

/// Outcome of [`map_static_code_to_large_pages`](crate::map_static_code_to_large_pages).
///
/// The raw values are errno-style codes so the status can cross an FFI or
/// process-exit boundary as a plain integer: `0` for success, `-1` for a
/// failed mapping call, and the positive errno that best describes the other
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// The text segment now lives on huge pages.
    Ok = 0,
    /// Compiled out, or the target OS has no implementation.
    NotSupported = libc::ENOTSUP,
    /// Compiled in, but the OS does not currently offer huge pages.
    Disabled = libc::EACCES,
    /// No suitable text region, or the region is smaller than one huge page.
    RegionNotFound = libc::ENOENT,
    /// A mapping or protection call failed; the OS error is logged separately.
    MappingFailure = -1,
}

impl StatusCode {
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Inverse of [`as_raw`](Self::as_raw). Unknown values yield `None`.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            libc::ENOTSUP => Some(Self::NotSupported),
            libc::EACCES => Some(Self::Disabled),
            libc::ENOENT => Some(Self::RegionNotFound),
            -1 => Some(Self::MappingFailure),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Human-readable sentence for this status.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotSupported => "Mapping to large pages is not supported.",
            Self::Disabled => "Large pages are not enabled.",
            Self::RegionNotFound => "failed to find text region",
            Self::MappingFailure => {
                "Mapping code to large pages failed. Reverting to default page size."
            }
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = i32;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Self::from_raw(raw).ok_or(raw)
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        status.as_raw()
    }
}

/// Describe a raw status value, as returned by [`StatusCode::as_raw`].
///
/// Values that are not a known [`StatusCode`] map to `"Unknown error"`.
#[must_use]
pub const fn large_pages_error(raw: i32) -> &'static str {
    match StatusCode::from_raw(raw) {
        Some(status) => status.description(),
        None => "Unknown error",
    }
}
