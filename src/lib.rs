//! # ExtentFS
//!
//! Userspace extent storage: a cached, write-back buffer layer and bitmap
//! extent allocator for extent-granular volumes.
//!
//! ## Architecture
//!
//! ```text
//!         ┌──────────────────────────────────────────────┐
//!         │                  FsContext                   │
//!         │   superblock · mount state · data extents    │
//!         └───────┬───────────────┬──────────────────────┘
//!                 │               │
//!         ┌───────▼──────┐ ┌──────▼───────┐
//!         │  meta Queue  │ │  data Queue  │   extent buffer caches
//!         └───────┬──────┘ └──────┬───────┘   (hash + CLEAN/DIRTY LRU,
//!                 │               │            reserved pool, cleaner)
//!         ┌───────▼───────────────▼──────┐
//!         │           IoEngine           │   worker pool, FIFO queue
//!         └──────────────┬───────────────┘
//!                        │
//!         ┌──────────────▼───────────────┐
//!         │         ExtentDevice         │   file or in-memory image
//!         └──────────────────────────────┘
//! ```
//!
//! The [`UnitAllocator`] sits beside the metadata queue: bitmap group
//! extents are ordinary cached buffers, so allocation metadata flows through
//! the same write-back machinery as everything else.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use extentfs::{FileDevice, FormatOptions, FsContext, MountOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(FileDevice::open("volume.img")?);
//! FsContext::format(device.clone(), FormatOptions::default())?;
//!
//! let fs = FsContext::mount(device, MountOptions::default())?;
//! let extent = fs.allocate_extent()?;
//! let buf = fs.new_data_extent(extent)?;
//! buf.data()[..5].copy_from_slice(b"hello");
//! buf.mark_dirty();
//! buf.put();
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod io_engine;

pub use alloc::UnitAllocator;
pub use cache::{BufferHandle, Queue, QueueConfig};
pub use context::{FormatOptions, FsContext, MountOptions, Superblock, SUPER_MAGIC};
pub use device::{ExtentDevice, FileDevice, MemDevice};
pub use error::{FsError, Result};
pub use io_engine::IoEngine;
