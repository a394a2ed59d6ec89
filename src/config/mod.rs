//! # Configuration Module
//!
//! Centralizes the numeric constants of the extentfs core. Constants whose
//! values depend on each other are co-located and the relationships are
//! enforced with compile-time assertions, so a change that would break the
//! on-disk geometry or deadlock the buffer pool fails at build time.
//!
//! ## Module Organization
//!
//! - [`constants`]: all numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
