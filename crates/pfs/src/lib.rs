#![forbid(unsafe_code)]
//! PageFS public API facade.
//!
//! Re-exports the engine from `pfs-core`. Transports, tools and tests depend
//! on this crate rather than on the engine crates directly.

pub use pfs_core::*;
