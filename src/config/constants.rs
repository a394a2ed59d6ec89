//! # Configuration Constants
//!
//! All tunables of the cache, I/O engine, and allocator in one place.
//!
//! ## Dependency Graph
//!
//! ```text
//! EXTENT_SIZE (per image, superblock field; bounds below)
//!       │
//!       ├─> BITMAP_HEADER_SIZE (1024 bytes, fixed on disk)
//!       │     group bit capacity = (extent_size - BITMAP_HEADER_SIZE) * 8
//!       │
//!       └─> SUPERBLOCK_OFFSET / SUPERBLOCK_SIZE (4096 each, fixed)
//!             the superblock must land on an extent boundary for every
//!             legal extent size, hence MIN_EXTENT_SIZE below
//!
//! DEFAULT_RESERVED_BUFFERS (32)
//!       │
//!       └─> upper bound on concurrently held buffers per queue; a caller
//!           holding more than this many handles at once blocks on the
//!           free-buffer condition until another handle is put back
//!
//! CLEANER_INTERVAL / BUFFER_MAX_AGE
//!       └─> the background cleaner wakes every CLEANER_INTERVAL and evicts
//!           idle buffers not touched for BUFFER_MAX_AGE; the interval must
//!           not exceed the age or eviction lags a full extra round
//! ```

use std::time::Duration;

// ============================================================================
// ON-DISK GEOMETRY
// Fixed by the format; changing any of these breaks existing images.
// ============================================================================

/// Byte offset of the superblock on the device.
pub const SUPERBLOCK_OFFSET: u64 = 4096;

/// Size of the superblock region in bytes.
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Size of the header region at the start of every bitmap group extent.
/// Only the first 16 bytes are populated; the rest is reserved. The bit
/// array starts immediately after this region.
pub const BITMAP_HEADER_SIZE: usize = 1024;

/// Smallest legal extent size. At 4 KiB the superblock occupies exactly
/// extent 1; larger sizes still keep it inside the first extent boundary
/// because both the offset and size are 4096.
pub const MIN_EXTENT_SIZE: usize = SUPERBLOCK_SIZE;

/// Largest legal extent size (8 MiB).
pub const MAX_EXTENT_SIZE: usize = 8 * 1024 * 1024;

const _: () = assert!(
    MIN_EXTENT_SIZE > BITMAP_HEADER_SIZE,
    "a bitmap group must have room for at least one bit after its header"
);

// ============================================================================
// BUFFER CACHE
// ============================================================================

/// Default number of buffers preallocated into a queue's reserved pool.
/// This is also the queue's total buffer count: the cache never allocates
/// buffer memory after construction.
pub const DEFAULT_RESERVED_BUFFERS: usize = 32;

/// How long a buffer may sit idle (hold count zero, untouched) before the
/// background cleaner evicts it.
pub const BUFFER_MAX_AGE: Duration = Duration::from_secs(10);

/// Wakeup period of the background cleaner thread.
pub const CLEANER_INTERVAL: Duration = Duration::from_secs(5);

const _: () = assert!(
    CLEANER_INTERVAL.as_secs() <= BUFFER_MAX_AGE.as_secs(),
    "cleaner must wake at least once per max-age window"
);

// ============================================================================
// I/O ENGINE
// ============================================================================

/// Number of worker threads servicing the I/O request queue.
pub const IO_WORKER_THREADS: usize = 5;
