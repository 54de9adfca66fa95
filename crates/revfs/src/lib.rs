#![forbid(unsafe_code)]
//! REVFS public API facade.
//!
//! Re-exports the filesystem from `revfs-core` through a stable external
//! interface. This is the crate downstream consumers depend on.

pub use revfs_core::*;
