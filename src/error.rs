//! # Error Types
//!
//! Unified error type for the extentfs core. Every fallible operation in the
//! cache, allocator, and mount path returns [`FsError`] through the crate-wide
//! [`Result`] alias.
//!
//! ## Taxonomy
//!
//! | Variant | Meaning | errno |
//! |-----------------|---------------------------------------------------|--------|
//! | `Device` | physical read/write failed for one extent | `EIO` |
//! | `OutOfSpace` | allocator exhausted a full wraparound of groups | `ENOSPC` |
//! | `InvalidArgument` | extent/unit/bit number outside its range | `EINVAL` |
//! | `Format` | bad magic or inconsistent geometry at mount | `EINVAL` |
//! | `OutOfMemory` | pool or index allocation failed at construction | `ENOMEM` |
//!
//! Invariant violations (evicting a held buffer, hold-count underflow, DIRTY
//! set while a read is in flight) are **not** represented here. They mean the
//! cache's bookkeeping has already diverged from reality, so they panic via
//! `assert!` at the point of detection rather than propagate.
//!
//! Errors are surfaced to the immediate caller exactly once and never retried
//! inside this crate; retry policy belongs to the layer above.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FsError>;

/// Error type for all extentfs core operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Physical I/O failed for the given extent. Recorded on the buffer by
    /// the I/O engine and surfaced once to the first waiter that observes it.
    #[error("device I/O failed at extent {extent}: {detail}")]
    Device { extent: u32, detail: String },

    /// Every bitmap group was searched over a full cursor wraparound and no
    /// clear bit was found.
    #[error("no free units left")]
    OutOfSpace,

    /// An extent number, unit number, or bit index was outside its declared
    /// range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The on-disk image is not an extentfs image or its geometry is
    /// internally inconsistent.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Buffer pool or index allocation failed while constructing a cache.
    #[error("out of memory building the buffer cache")]
    OutOfMemory,
}

impl FsError {
    /// POSIX errno for the (out of scope) filesystem-operation boundary.
    ///
    /// Exhaustive on purpose: adding a variant without assigning an errno is
    /// a compile error.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Device { .. } => libc_consts::EIO,
            FsError::OutOfSpace => libc_consts::ENOSPC,
            FsError::InvalidArgument(_) => libc_consts::EINVAL,
            FsError::Format(_) => libc_consts::EINVAL,
            FsError::OutOfMemory => libc_consts::ENOMEM,
        }
    }
}

impl From<std::collections::TryReserveError> for FsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        FsError::OutOfMemory
    }
}

/// The handful of errno values this crate maps to, kept local so the core
/// does not pull in a libc dependency.
mod libc_consts {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(
            FsError::Device {
                extent: 7,
                detail: "short read".into()
            }
            .to_errno(),
            5
        );
        assert_eq!(FsError::OutOfSpace.to_errno(), 28);
        assert_eq!(FsError::Format("bad magic".into()).to_errno(), 22);
        assert_eq!(FsError::OutOfMemory.to_errno(), 12);
    }

    #[test]
    fn device_error_displays_extent() {
        let err = FsError::Device {
            extent: 42,
            detail: "unexpected end of file".into(),
        };
        assert!(err.to_string().contains("extent 42"));
    }
}
