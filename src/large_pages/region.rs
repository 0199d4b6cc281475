use super::align::{align_down, align_up, HUGE_PAGE_SIZE};

/// The part of the executable's code segment that can be moved onto huge
/// pages: `[from, to)`, both huge-page aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRegion {
    from: usize,
    to: usize,
    found: bool,
}

impl TextRegion {
    pub const NOT_FOUND: Self = Self {
        from: 0,
        to: 0,
        found: false,
    };

    /// Shrink the raw code range `[start, end)` to whole huge pages: `start`
    /// rounds up and `end` rounds down. A range that collapses to nothing is
    /// reported as not found; it is too small to benefit.
    #[must_use]
    pub const fn from_raw_bounds(start: usize, end: usize) -> Self {
        let from = align_up(start);
        let to = align_down(end);
        // `from < start` only when rounding up wrapped past the top.
        if from >= to || from < start {
            return Self::NOT_FOUND;
        }
        Self {
            from,
            to,
            found: true,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_found(&self) -> bool {
        self.found
    }

    /// First byte of the region. Meaningless unless [`is_found`](Self::is_found).
    #[inline]
    #[must_use]
    pub const fn from(&self) -> usize {
        self.from
    }

    /// One past the last byte of the region.
    #[inline]
    #[must_use]
    pub const fn to(&self) -> usize {
        self.to
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.to - self.from
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn total_huge_pages(&self) -> usize {
        self.len() / HUGE_PAGE_SIZE
    }
}

#[cfg_attr(not(all(feature = "large-pages", target_os = "linux")), allow(dead_code))]
/// Link-time anchors of the executable's own text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TextMarkers {
    /// Very beginning of the code segment. `None` when the binary does not
    /// define the marker; the text cannot be located then.
    pub(crate) text_start: Option<usize>,
    /// First byte of the remap routine's section. The region never reaches
    /// past it.
    pub(crate) stub_start: usize,
}

#[cfg_attr(not(all(feature = "large-pages", target_os = "linux")), allow(dead_code))]
/// One line of `/proc/self/maps`:
///
/// ```text
/// address           perms offset  dev   inode       pathname
/// 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapsEntry<'a> {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) perms: &'a str,
    pub(crate) inode: u64,
}

#[cfg_attr(not(all(feature = "large-pages", target_os = "linux")), allow(dead_code))]
impl<'a> MapsEntry<'a> {
    pub(crate) fn parse(line: &'a str) -> Option<Self> {
        let mut fields = line.split_ascii_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        let _offset = fields.next()?;
        let _dev = fields.next()?;
        let inode = fields.next()?.parse().ok()?;
        Some(Self {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            perms,
            inode,
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[cfg_attr(not(all(feature = "large-pages", target_os = "linux")), allow(dead_code))]
/// Find the text region in the contents of `/proc/self/maps`.
///
/// The first file-backed, `r-xp` mapping that contains the start marker is
/// taken; the file mapping may begin earlier than the text, so its start is
/// clamped to the marker, and its end to the remap routine's section when
/// that falls inside. Later mappings are never considered.
pub(crate) fn find_in_maps(maps: &str, markers: &TextMarkers) -> TextRegion {
    let Some(text_start) = markers.text_start else {
        return TextRegion::NOT_FOUND;
    };

    for entry in maps.lines().filter_map(MapsEntry::parse) {
        if entry.inode == 0 || entry.perms != "r-xp" || !entry.contains(text_start) {
            continue;
        }

        let mut end = entry.end;
        if markers.stub_start > text_start && markers.stub_start <= end {
            end = markers.stub_start;
        }
        return TextRegion::from_raw_bounds(text_start, end);
    }

    TextRegion::NOT_FOUND
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "large-pages", target_os = "linux"))] {
        pub(crate) const PROC_SELF_MAPS: &str = "/proc/self/maps";

        pub(crate) fn find_text_region() -> TextRegion {
            let markers = TextMarkers {
                text_start: super::remap::text_start_marker(),
                stub_start: super::remap::stub_section().0,
            };
            if markers.text_start.is_none() {
                log::debug!("no text start marker linked in; text region cannot be located");
                return TextRegion::NOT_FOUND;
            }

            match std::fs::read_to_string(PROC_SELF_MAPS) {
                Ok(maps) => find_in_maps(&maps, &markers),
                Err(e) => {
                    log::warn!("could not open {PROC_SELF_MAPS}: {e}");
                    TextRegion::NOT_FOUND
                }
            }
        }
    } else if #[cfg(all(feature = "large-pages", target_os = "freebsd"))] {
        pub(crate) use freebsd::find_text_region;
    } else if #[cfg(all(feature = "large-pages", target_os = "macos"))] {
        pub(crate) use macos::find_text_region;
    }
}

#[cfg(all(feature = "large-pages", target_os = "freebsd"))]
mod freebsd {
    use super::TextRegion;
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr::addr_of;

    const KERN_PROC_VMMAP: libc::c_int = 32;
    const KVME_PROT_READ: libc::c_int = 0x1;
    const KVME_PROT_EXEC: libc::c_int = 0x4;

    /// Walk the kernel's `kinfo_vmentry` table for this process and take the
    /// first readable+executable mapping of the running executable's file.
    pub(crate) fn find_text_region() -> TextRegion {
        let exe = match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                log::warn!("could not resolve the executable path: {e}");
                return TextRegion::NOT_FOUND;
            }
        };
        let Some(buf) = read_vmmap() else {
            return TextRegion::NOT_FOUND;
        };

        let mut offset = 0;
        while offset < buf.len() {
            // Safety: `offset` is within the buffer and entries are packed
            // back to back; fields are read unaligned.
            let entry = unsafe { buf.as_ptr().add(offset).cast::<libc::kinfo_vmentry>() };
            // Safety: as above.
            let structsize = unsafe { addr_of!((*entry).kve_structsize).read_unaligned() };
            let Ok(structsize) = usize::try_from(structsize) else {
                break;
            };
            if structsize == 0 || offset + structsize > buf.len() {
                break;
            }
            offset += structsize;

            // Safety: the entry lies fully inside the buffer.
            let (start, end, protection, path) = unsafe {
                (
                    addr_of!((*entry).kve_start).read_unaligned(),
                    addr_of!((*entry).kve_end).read_unaligned(),
                    addr_of!((*entry).kve_protection).read_unaligned(),
                    CStr::from_ptr(addr_of!((*entry).kve_path).cast::<libc::c_char>()),
                )
            };

            let executable = protection & KVME_PROT_READ != 0 && protection & KVME_PROT_EXEC != 0;
            if !executable || path.is_empty() {
                continue;
            }
            if Path::new(OsStr::from_bytes(path.to_bytes())) != exe {
                continue;
            }

            let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
                return TextRegion::NOT_FOUND;
            };
            return TextRegion::from_raw_bounds(start, end);
        }

        TextRegion::NOT_FOUND
    }

    fn read_vmmap() -> Option<Vec<u8>> {
        // Safety: FFI call to getpid.
        let pid = unsafe { libc::getpid() };
        let mib = [libc::CTL_KERN, libc::KERN_PROC, KERN_PROC_VMMAP, pid];

        let mut len = 0usize;
        // Safety: size query, no output buffer.
        if unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null(),
                0,
            )
        } == -1
        {
            log::warn!("sysctl(KERN_PROC_VMMAP) failed: {}", std::io::Error::last_os_error());
            return None;
        }

        // The map can grow between the two calls.
        len = len * 4 / 3;
        let mut buf = vec![0u8; len];
        // Safety: `buf` holds `len` writable bytes.
        if unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &mut len,
                std::ptr::null(),
                0,
            )
        } == -1
        {
            log::warn!("sysctl(KERN_PROC_VMMAP) failed: {}", std::io::Error::last_os_error());
            return None;
        }
        buf.truncate(len);
        Some(buf)
    }
}

#[cfg(all(feature = "large-pages", target_os = "macos"))]
mod macos {
    use super::TextRegion;

    type KernReturn = libc::c_int;
    type Natural = libc::c_uint;

    const KERN_SUCCESS: KernReturn = 0;
    const VM_PROT_READ: libc::c_int = 0x1;
    const VM_PROT_EXECUTE: libc::c_int = 0x4;

    /// `vm_region_submap_info_64` from `<mach/vm_region.h>`, which is declared
    /// under `#pragma pack(4)`.
    #[repr(C, packed(4))]
    #[derive(Default)]
    struct SubmapInfo64 {
        protection: libc::c_int,
        max_protection: libc::c_int,
        inheritance: libc::c_uint,
        offset: u64,
        user_tag: libc::c_uint,
        pages_resident: libc::c_uint,
        pages_shared_now_private: libc::c_uint,
        pages_swapped_out: libc::c_uint,
        pages_dirtied: libc::c_uint,
        ref_count: libc::c_uint,
        shadow_depth: libc::c_ushort,
        external_pager: libc::c_uchar,
        share_mode: libc::c_uchar,
        is_submap: libc::c_int,
        behavior: libc::c_int,
        object_id: libc::c_uint,
        user_wired_count: libc::c_ushort,
        pages_reusable: libc::c_uint,
        object_id_full: u64,
    }

    const SUBMAP_INFO_COUNT_64: Natural =
        (std::mem::size_of::<SubmapInfo64>() / std::mem::size_of::<Natural>()) as Natural;

    extern "C" {
        static mach_task_self_: libc::c_uint;

        fn vm_region_recurse_64(
            target_task: libc::c_uint,
            address: *mut usize,
            size: *mut usize,
            nesting_depth: *mut Natural,
            info: *mut libc::c_int,
            info_count: *mut Natural,
        ) -> KernReturn;
    }

    /// Walk the task's region tree, descending into submaps, and take the
    /// first readable+executable leaf region. It is clamped so that it ends
    /// before the remap routine.
    pub(crate) fn find_text_region() -> TextRegion {
        let stub = super::super::remap::stub_address();
        let mut addr = 0usize;
        let mut depth: Natural = 1;

        loop {
            let mut size = 0usize;
            let mut info = SubmapInfo64::default();
            let mut count = SUBMAP_INFO_COUNT_64;
            // Safety: FFI call with valid out-pointers; `info` is large enough
            // for `count` naturals.
            let kr = unsafe {
                vm_region_recurse_64(
                    mach_task_self_,
                    &mut addr,
                    &mut size,
                    &mut depth,
                    std::ptr::addr_of_mut!(info).cast::<libc::c_int>(),
                    &mut count,
                )
            };
            if kr != KERN_SUCCESS {
                return TextRegion::NOT_FOUND;
            }

            if info.is_submap != 0 {
                depth += 1;
                continue;
            }

            let protection = info.protection;
            let executable =
                protection & VM_PROT_READ != 0 && protection & VM_PROT_EXECUTE != 0;
            let mut end = addr.saturating_add(size);
            if stub > addr && stub <= end {
                end = stub;
            }
            let region = TextRegion::from_raw_bounds(addr, end);
            if executable && region.is_found() {
                return region;
            }

            addr = addr.saturating_add(size);
        }
    }
}
