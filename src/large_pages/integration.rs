//! Live tests against the running test binary's own address space.
