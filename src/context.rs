//! # Filesystem Context
//!
//! Superblock parsing, volume formatting, and the mounted-state wiring that
//! ties the device, I/O engine, caches, and allocator together.
//!
//! ## Volume Layout
//!
//! ```text
//! byte 0        4096      8192
//! ┌──────────┬──────────┬───────────────────────┬─────────────────────┐
//! │ boot pad │ superblk │ bitmap groups         │ data extents        │
//! └──────────┴──────────┴───────────────────────┴─────────────────────┘
//!   extent(s) 0..bitmap_offset   bitmap_count     extent_count - ...
//! ```
//!
//! The superblock lives at a fixed byte offset independent of the extent
//! size and is read and written directly through the device, never through
//! a cache queue. Everything after it is extent-granular: the bitmap groups
//! are cached by the metadata queue, data extents by the data queue. The
//! data queue is based at the first data extent so data extent numbers and
//! allocator units coincide.
//!
//! ## Mount State
//!
//! Mounting stamps the superblock DIRTY and records the mount time; a clean
//! unmount flushes both queues, persists the allocator cursor, and stamps
//! CLEAN. A missing CLEAN stamp at the next mount means the volume was not
//! shut down properly.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::UnitAllocator;
use crate::cache::{BufferHandle, Queue, QueueConfig};
use crate::config::{
    BITMAP_HEADER_SIZE, IO_WORKER_THREADS, MAX_EXTENT_SIZE, MIN_EXTENT_SIZE, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};
use crate::device::ExtentDevice;
use crate::error::{FsError, Result};
use crate::io_engine::IoEngine;

pub const SUPER_MAGIC: u32 = 0xABCD_EF01;

const STATE_CLEAN: u32 = 0;
const STATE_DIRTY: u32 = 1;

/// On-disk superblock, little-endian, at byte offset 4096. The rest of the
/// 4096-byte superblock area is zero padding.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Superblock {
    magic: U32,
    extent_size: U32,
    extent_count: U32,
    bitmap_count: U32,
    bitmap_current: U32,
    bitmap_offset: U32,
    ctime: U32,
    mount_time: U32,
    state: U32,
    uuid: [u8; 16],
}

impl Superblock {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let (sb, _) = Self::read_from_prefix(bytes)
            .map_err(|_| FsError::Format("superblock area too short".into()))?;
        if sb.magic.get() != SUPER_MAGIC {
            return Err(FsError::Format(format!(
                "bad magic {:#010x}, not an extentfs volume",
                sb.magic.get()
            )));
        }
        let extent_size = sb.extent_size.get() as usize;
        if !extent_size.is_power_of_two()
            || !(MIN_EXTENT_SIZE..=MAX_EXTENT_SIZE).contains(&extent_size)
        {
            return Err(FsError::Format(format!(
                "unsupported extent size {extent_size}"
            )));
        }
        let count = sb.extent_count.get();
        let bm_off = sb.bitmap_offset.get();
        let bm_cnt = sb.bitmap_count.get();
        if bm_cnt == 0
            || bm_off < super_reserved_extents(extent_size)
            || u64::from(bm_off) + u64::from(bm_cnt) >= u64::from(count)
        {
            return Err(FsError::Format(format!(
                "inconsistent geometry: {count} extents, bitmap at {bm_off}+{bm_cnt}"
            )));
        }
        if sb.bitmap_current.get() >= bm_cnt {
            return Err(FsError::Format("allocator cursor out of range".into()));
        }
        Ok(sb)
    }

    pub fn extent_size(&self) -> usize {
        self.extent_size.get() as usize
    }

    pub fn extent_count(&self) -> u32 {
        self.extent_count.get()
    }

    pub fn bitmap_offset(&self) -> u32 {
        self.bitmap_offset.get()
    }

    pub fn bitmap_count(&self) -> u32 {
        self.bitmap_count.get()
    }

    /// First data extent; also the data queue's base.
    pub fn data_offset(&self) -> u32 {
        self.bitmap_offset.get() + self.bitmap_count.get()
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    /// True if the last mount was shut down through `unmount`.
    pub fn was_clean(&self) -> bool {
        self.state.get() == STATE_CLEAN
    }
}

/// Extents swallowed by the boot pad and superblock area.
fn super_reserved_extents(extent_size: usize) -> u32 {
    let end = SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64;
    end.div_ceil(extent_size as u64) as u32
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn read_superblock(device: &dyn ExtentDevice) -> Result<Superblock> {
    let mut buf = vec![0u8; SUPERBLOCK_SIZE];
    device
        .read_at(SUPERBLOCK_OFFSET, &mut buf)
        .map_err(|err| FsError::Format(format!("superblock read failed: {err}")))?;
    Superblock::parse(&buf)
}

fn write_superblock(device: &dyn ExtentDevice, sb: &Superblock) -> Result<()> {
    let mut buf = vec![0u8; SUPERBLOCK_SIZE];
    buf[..size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    device
        .write_at(SUPERBLOCK_OFFSET, &buf)
        .map_err(|err| FsError::Format(format!("superblock write failed: {err}")))
}

/// Volume creation parameters.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub extent_size: usize,
    pub uuid: [u8; 16],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            extent_size: MIN_EXTENT_SIZE,
            uuid: [0; 16],
        }
    }
}

/// Mount tuning knobs.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub meta_buffers: usize,
    pub data_buffers: usize,
    pub io_workers: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            meta_buffers: defaults.reserved_buffers,
            data_buffers: defaults.reserved_buffers,
            io_workers: IO_WORKER_THREADS,
        }
    }
}

struct SuperState {
    sb: Superblock,
    dirty: bool,
}

/// A mounted volume.
pub struct FsContext {
    device: Arc<dyn ExtentDevice>,
    meta_queue: Arc<Queue>,
    data_queue: Arc<Queue>,
    extent_alloc: UnitAllocator,
    super_state: Mutex<SuperState>,
}

impl fmt::Debug for FsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsContext").finish_non_exhaustive()
    }
}

impl FsContext {
    /// Write a fresh filesystem onto `device`. Every byte after the boot pad
    /// is owned by the new volume; existing content is not preserved.
    pub fn format(device: Arc<dyn ExtentDevice>, opts: FormatOptions) -> Result<()> {
        let extent_size = opts.extent_size;
        if !extent_size.is_power_of_two()
            || !(MIN_EXTENT_SIZE..=MAX_EXTENT_SIZE).contains(&extent_size)
        {
            return Err(FsError::InvalidArgument(format!(
                "unsupported extent size {extent_size}"
            )));
        }
        let extent_count = (device.len_bytes() / extent_size as u64)
            .try_into()
            .unwrap_or(u32::MAX);
        let bitmap_offset = super_reserved_extents(extent_size);
        let capacity = ((extent_size - BITMAP_HEADER_SIZE) * 8) as u64;
        let avail = u64::from(
            extent_count
                .checked_sub(bitmap_offset + 1)
                .ok_or_else(|| FsError::InvalidArgument("device too small".into()))?,
        ) + 1;
        // Each group extent describes up to `capacity` data extents; take
        // the fewest groups whose bits cover what remains.
        let bitmap_count = avail.div_ceil(capacity + 1) as u32;
        let data_extents = avail as u32 - bitmap_count;
        if data_extents == 0 {
            return Err(FsError::InvalidArgument("device too small".into()));
        }

        let sb = Superblock {
            magic: U32::new(SUPER_MAGIC),
            extent_size: U32::new(extent_size as u32),
            extent_count: U32::new(extent_count),
            bitmap_count: U32::new(bitmap_count),
            bitmap_current: U32::new(0),
            bitmap_offset: U32::new(bitmap_offset),
            ctime: U32::new(unix_now()),
            mount_time: U32::new(0),
            state: U32::new(STATE_CLEAN),
            uuid: opts.uuid,
        };
        write_superblock(device.as_ref(), &sb)?;

        let engine = Arc::new(IoEngine::new(
            Arc::clone(&device),
            extent_size,
            IO_WORKER_THREADS,
        )?);
        let queue = Queue::create(engine, QueueConfig::default())?;
        UnitAllocator::format(&queue, bitmap_offset, bitmap_count, u64::from(data_extents))?;
        queue.flush()?;
        device
            .sync()
            .map_err(|err| FsError::Format(format!("format sync failed: {err}")))?;
        info!(
            extent_count,
            bitmap_count, data_extents, "formatted new volume"
        );
        Ok(())
    }

    pub fn mount(device: Arc<dyn ExtentDevice>, opts: MountOptions) -> Result<FsContext> {
        let mut sb = read_superblock(device.as_ref())?;
        if !sb.was_clean() {
            warn!("volume was not unmounted cleanly");
        }

        let engine = Arc::new(IoEngine::new(
            Arc::clone(&device),
            sb.extent_size(),
            opts.io_workers,
        )?);
        let meta_queue = Arc::new(Queue::create(
            Arc::clone(&engine),
            QueueConfig {
                reserved_buffers: opts.meta_buffers,
                extent_base: 0,
                ..QueueConfig::default()
            },
        )?);
        let data_queue = Arc::new(Queue::create(
            engine,
            QueueConfig {
                reserved_buffers: opts.data_buffers,
                extent_base: sb.data_offset(),
                ..QueueConfig::default()
            },
        )?);
        let extent_alloc = UnitAllocator::new(
            Arc::clone(&meta_queue),
            sb.bitmap_offset(),
            sb.bitmap_count(),
        )?;
        extent_alloc.set_cursor(sb.bitmap_current.get())?;

        sb.mount_time = U32::new(unix_now());
        sb.state = U32::new(STATE_DIRTY);
        write_superblock(device.as_ref(), &sb)?;
        debug!(
            extent_count = sb.extent_count(),
            data_offset = sb.data_offset(),
            "mounted volume"
        );

        Ok(FsContext {
            device,
            meta_queue,
            data_queue,
            extent_alloc,
            super_state: Mutex::new(SuperState { sb, dirty: false }),
        })
    }

    pub fn superblock(&self) -> Superblock {
        self.super_state.lock().sb.clone()
    }

    pub fn meta_queue(&self) -> &Arc<Queue> {
        &self.meta_queue
    }

    pub fn data_queue(&self) -> &Arc<Queue> {
        &self.data_queue
    }

    /// Grant a free data extent. The returned number addresses the data
    /// queue directly.
    pub fn allocate_extent(&self) -> Result<u32> {
        let unit = self.extent_alloc.allocate()?;
        self.super_state.lock().dirty = true;
        Ok(unit)
    }

    /// Return a data extent to the pool; see [`UnitAllocator::free`] for
    /// the `sync` flag.
    pub fn free_extent(&self, extent: u32, sync: bool) -> Result<()> {
        self.extent_alloc.free(extent, sync)?;
        self.super_state.lock().dirty = true;
        Ok(())
    }

    pub fn free_extents(&self) -> Result<u64> {
        self.extent_alloc.free_units()
    }

    /// Content of a data extent, read through the cache.
    pub fn read_data_extent(&self, extent: u32) -> Result<BufferHandle> {
        self.data_queue.read_extent(extent)
    }

    /// A zeroed buffer for a freshly allocated data extent.
    pub fn new_data_extent(&self, extent: u32) -> Result<BufferHandle> {
        self.data_queue.new_extent(extent)
    }

    /// Push every dirty buffer and the superblock to the device.
    pub fn sync(&self) -> Result<()> {
        self.meta_queue.flush()?;
        self.data_queue.flush()?;
        self.sync_super()?;
        self.device
            .sync()
            .map_err(|err| FsError::Format(format!("device sync failed: {err}")))
    }

    fn sync_super(&self) -> Result<()> {
        let mut state = self.super_state.lock();
        let cursor = self.extent_alloc.cursor();
        if !state.dirty && state.sb.bitmap_current.get() == cursor {
            return Ok(());
        }
        state.sb.bitmap_current = U32::new(cursor);
        write_superblock(self.device.as_ref(), &state.sb)?;
        state.dirty = false;
        Ok(())
    }

    /// Flush everything, stamp the superblock CLEAN, and tear down.
    pub fn unmount(self) -> Result<()> {
        self.meta_queue.flush()?;
        self.data_queue.flush()?;
        {
            let mut state = self.super_state.lock();
            state.sb.bitmap_current = U32::new(self.extent_alloc.cursor());
            state.sb.state = U32::new(STATE_CLEAN);
            write_superblock(self.device.as_ref(), &state.sb)?;
        }
        self.device
            .sync()
            .map_err(|err| FsError::Format(format!("unmount sync failed: {err}")))?;
        info!("volume unmounted");
        Ok(())
    }
}
