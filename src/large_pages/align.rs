//! Huge-page boundary arithmetic.

/// Huge page size the text segment is moved onto. Hard-coded: every supported
/// platform backs code with 2MiB pages (x86_64 PMD / FreeBSD superpage / XNU
/// superpage).
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Round `addr` up to the next huge page boundary.
///
/// Addresses within one huge page of `usize::MAX` wrap to zero; no userspace
/// mapping lives up there.
#[inline]
#[must_use]
pub const fn align_up(addr: usize) -> usize {
    addr.wrapping_add(HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1)
}

/// Round `addr` down to the previous huge page boundary.
#[inline]
#[must_use]
pub const fn align_down(addr: usize) -> usize {
    addr & !(HUGE_PAGE_SIZE - 1)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_align_known_values() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), HUGE_PAGE_SIZE);
        assert_eq!(align_up(0x40_0000), 0x40_0000);
        assert_eq!(align_up(0x40_0001), 0x60_0000);
        assert_eq!(align_down(0x4A_1234), 0x40_0000);
        assert_eq!(align_down(0x5F_FFFF), 0x40_0000);
        assert_eq!(align_down(0x60_0000), 0x60_0000);
    }

    #[test]
    fn test_huge_page_size_is_power_of_two() {
        assert!(HUGE_PAGE_SIZE.is_power_of_two());
        assert_eq!(HUGE_PAGE_SIZE, 0x20_0000);
    }

    proptest::proptest! {
        #[test]
        fn align_down_is_aligned_and_not_above(addr: usize) {
            let down = align_down(addr);
            proptest::prop_assert_eq!(down % HUGE_PAGE_SIZE, 0);
            proptest::prop_assert!(down <= addr);
            proptest::prop_assert!(addr - down < HUGE_PAGE_SIZE);
        }

        #[test]
        fn align_up_is_aligned_and_not_below(addr in 0..usize::MAX - HUGE_PAGE_SIZE) {
            let up = align_up(addr);
            proptest::prop_assert_eq!(up % HUGE_PAGE_SIZE, 0);
            proptest::prop_assert!(up >= addr);
            proptest::prop_assert!(up - addr < HUGE_PAGE_SIZE);
        }

        #[test]
        fn aligned_addresses_are_fixed_points(page in 0..(usize::MAX / HUGE_PAGE_SIZE)) {
            let addr = page * HUGE_PAGE_SIZE;
            proptest::prop_assert_eq!(align_up(addr), addr);
            proptest::prop_assert_eq!(align_down(addr), addr);
        }
    }
}
