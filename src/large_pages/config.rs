use std::fmt;
use std::str::FromStr;

use super::manager::map_static_code_to_large_pages;
use super::status::{large_pages_error, StatusCode};

/// Environment variable read by [`LargePagesMode::from_env`].
pub const LARGE_PAGES_ENV: &str = "HUGETEXT_LARGE_PAGES";

/// Whether, and how loudly, a binary moves its text onto huge pages at
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LargePagesMode {
    /// Leave the text on regular pages.
    #[default]
    Off,
    /// Move the text and warn when that does not work out.
    On,
    /// Move the text, say nothing either way.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid large pages mode `{}` (expected off, on or silent)",
            self.0
        )
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for LargePagesMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("off") {
            Ok(Self::Off)
        } else if s.eq_ignore_ascii_case("on") {
            Ok(Self::On)
        } else if s.eq_ignore_ascii_case("silent") {
            Ok(Self::Silent)
        } else {
            Err(ParseModeError(s.to_owned()))
        }
    }
}

impl fmt::Display for LargePagesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Silent => "silent",
        })
    }
}

impl LargePagesMode {
    /// Mode selected by `HUGETEXT_LARGE_PAGES`. Unset means [`Off`](Self::Off);
    /// so does a value that does not parse, after a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_setting(std::env::var(LARGE_PAGES_ENV).ok().as_deref())
    }

    fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::parse::<Self>) {
            None => Self::Off,
            Some(Ok(mode)) => mode,
            Some(Err(e)) => {
                log::warn!("{LARGE_PAGES_ENV}: {e}");
                Self::Off
            }
        }
    }

    /// Act on the mode: call [`map_static_code_to_large_pages`] unless `Off`.
    ///
    /// Returns the status, or `None` when nothing was attempted. Same threading
    /// rules as the entry point.
    pub fn apply(self) -> Option<StatusCode> {
        self.apply_with(map_static_code_to_large_pages)
    }

    fn apply_with(self, map: impl FnOnce() -> StatusCode) -> Option<StatusCode> {
        if self == Self::Off {
            return None;
        }
        let status = map();
        if self == Self::On && !status.is_ok() {
            log::warn!("{}", large_pages_error(status.as_raw()));
        }
        Some(status)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("off".parse(), Ok(LargePagesMode::Off));
        assert_eq!("ON".parse(), Ok(LargePagesMode::On));
        assert_eq!(" Silent\n".parse(), Ok(LargePagesMode::Silent));

        let err = "sometimes".parse::<LargePagesMode>().unwrap_err();
        assert!(err.to_string().contains("`sometimes`"), "{err}");
        assert!("".parse::<LargePagesMode>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for mode in [LargePagesMode::Off, LargePagesMode::On, LargePagesMode::Silent] {
            assert_eq!(mode.to_string().parse(), Ok(mode));
        }
        assert_eq!(LargePagesMode::default(), LargePagesMode::Off);
    }

    #[test]
    fn test_setting_defaults_to_off() {
        assert_eq!(LargePagesMode::from_setting(None), LargePagesMode::Off);
        assert_eq!(LargePagesMode::from_setting(Some("yes")), LargePagesMode::Off);
        assert_eq!(LargePagesMode::from_setting(Some("on")), LargePagesMode::On);
        assert_eq!(
            LargePagesMode::from_setting(Some("SILENT")),
            LargePagesMode::Silent
        );
    }

    #[test]
    fn test_off_never_maps() {
        let calls = Cell::new(0);
        let status = LargePagesMode::Off.apply_with(|| {
            calls.set(calls.get() + 1);
            StatusCode::Ok
        });
        assert_eq!(status, None);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_on_and_silent_report_status() {
        for mode in [LargePagesMode::On, LargePagesMode::Silent] {
            let calls = Cell::new(0);
            let status = mode.apply_with(|| {
                calls.set(calls.get() + 1);
                StatusCode::Disabled
            });
            assert_eq!(status, Some(StatusCode::Disabled), "{mode}");
            assert_eq!(calls.get(), 1);
        }
    }
}
