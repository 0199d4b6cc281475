//! Runtime check for OS huge page support. No side effects beyond reading
//! system configuration.

/// Whether a transparent hugepage policy string allows our mapping to be
/// backed by huge pages.
///
/// The kernel lists every policy and brackets the active one:
/// `always [madvise] never`. `[always]` and `[madvise]` both work since the
/// remap explicitly advises `MADV_HUGEPAGE`.
#[cfg_attr(not(all(feature = "large-pages", target_os = "linux")), allow(dead_code))]
pub(crate) fn thp_policy_allows_huge_pages(policy: &str) -> bool {
    policy
        .split_ascii_whitespace()
        .any(|token| token == "[always]" || token == "[madvise]")
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "large-pages", target_os = "linux"))] {
        pub(crate) const THP_ENABLED_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";

        /// Linux: transparent hugepages must be in `always` or `madvise` mode.
        pub(crate) fn huge_pages_enabled() -> bool {
            match std::fs::read_to_string(THP_ENABLED_PATH) {
                Ok(policy) => {
                    let enabled = thp_policy_allows_huge_pages(&policy);
                    log::debug!("transparent hugepage policy `{}`: enabled={enabled}", policy.trim());
                    enabled
                }
                Err(e) => {
                    log::warn!("could not open {THP_ENABLED_PATH}: {e}");
                    false
                }
            }
        }
    } else if #[cfg(all(feature = "large-pages", target_os = "freebsd"))] {
        /// FreeBSD: superpage promotion must be on (`vm.pmap.pg_ps_enabled`).
        /// It is by default on amd64.
        pub(crate) fn huge_pages_enabled() -> bool {
            let mut super_pages: libc::c_uint = 0;
            let mut len = std::mem::size_of::<libc::c_uint>();
            // Safety: FFI call to sysctlbyname with a correctly sized output.
            let ret = unsafe {
                libc::sysctlbyname(
                    c"vm.pmap.pg_ps_enabled".as_ptr(),
                    std::ptr::addr_of_mut!(super_pages).cast::<libc::c_void>(),
                    &mut len,
                    std::ptr::null(),
                    0,
                )
            };
            let enabled = ret != -1 && super_pages >= 1;
            log::debug!("vm.pmap.pg_ps_enabled={super_pages}: enabled={enabled}");
            enabled
        }
    } else if #[cfg(all(feature = "large-pages", target_os = "macos", target_arch = "x86_64"))] {
        /// Intel Macs always have 2MB superpages (PSE).
        pub(crate) fn huge_pages_enabled() -> bool {
            true
        }
    } else if #[cfg(all(feature = "large-pages", target_os = "macos"))] {
        /// Apple Silicon has no superpage mechanism; any superpage request
        /// fails with `KERN_INVALID_ARGUMENT`.
        pub(crate) fn huge_pages_enabled() -> bool {
            false
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_thp_policy_tokens() {
        assert!(thp_policy_allows_huge_pages("[always] madvise never\n"));
        assert!(thp_policy_allows_huge_pages("always [madvise] never\n"));
        assert!(!thp_policy_allows_huge_pages("always madvise [never]\n"));
        assert!(!thp_policy_allows_huge_pages(""));
        // Unbracketed names are just the list of choices.
        assert!(!thp_policy_allows_huge_pages("always madvise never"));
        assert!(!thp_policy_allows_huge_pages("[alwaysmadvise] never"));
    }

    #[cfg(all(feature = "large-pages", target_os = "linux"))]
    #[test]
    fn test_probe_agrees_with_sysfs() {
        let expected = std::fs::read_to_string(THP_ENABLED_PATH)
            .map(|policy| thp_policy_allows_huge_pages(&policy))
            .unwrap_or(false);
        assert_eq!(huge_pages_enabled(), expected);
    }
}
