pub(crate) mod align;
pub(crate) mod config;
pub(crate) mod integration;
pub(crate) mod loom_tests;
// Only the entry point survives when the pipeline is compiled out.
#[cfg_attr(
    not(all(
        feature = "large-pages",
        any(target_os = "linux", target_os = "freebsd", target_os = "macos")
    )),
    allow(dead_code)
)]
pub(crate) mod manager;
pub(crate) mod probe;
pub(crate) mod region;
#[cfg_attr(
    not(all(
        feature = "large-pages",
        any(target_os = "linux", target_os = "freebsd", target_os = "macos")
    )),
    allow(dead_code)
)]
pub(crate) mod remap;
pub(crate) mod stats;
pub(crate) mod status;
#[cfg_attr(
    not(all(
        feature = "large-pages",
        any(target_os = "linux", target_os = "freebsd", target_os = "macos")
    )),
    allow(dead_code)
)]
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
