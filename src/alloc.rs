//! # Unit Allocator
//!
//! Bitmap-backed allocation of fixed-size units (data extents, inode slots)
//! over a run of bitmap group extents cached through a [`Queue`].
//!
//! ## Layout
//!
//! ```text
//! group extent g (at group_start + g):
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ GroupHeader (16 B)   │ bitmap: total_cnt bits, LE u32 words     │
//! │ + padding to 1024 B  │ (capacity = (extent_size - 1024) * 8)    │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Unit numbers are dense across groups with a fixed stride of `capacity`
//! bits per group, so `unit = group * capacity + bit` regardless of how many
//! bits the final group actually uses.
//!
//! ## Search Policy
//!
//! Each group header carries a `current_position` hint: the bit granted by
//! the last successful allocation in that group. A search starts at that
//! hint (the freed-and-reallocated case is handled by the reset below, not
//! by scanning backwards). When a group yields nothing its hint is reset to
//! zero, so the next pass over the group sees every free bit. A group-level
//! cursor plays the same role across groups; when a full cycle of groups
//! produces nothing the allocator reports [`FsError::OutOfSpace`].
//!
//! One allocator-wide lock covers the cursor and the whole search, so two
//! concurrent allocations can never grant the same unit. Header and bitmap
//! mutations are written back synchronously on the allocation path; frees
//! may defer the write to the cache's dirty list.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bitmap::{Bitmap, GroupHeader};
use crate::cache::Queue;
use crate::config::BITMAP_HEADER_SIZE;
use crate::error::{FsError, Result};

/// Allocator over `group_count` bitmap group extents starting at
/// `group_start` in its queue's extent space.
pub struct UnitAllocator {
    queue: Arc<Queue>,
    cursor: Mutex<u32>,
    group_start: u32,
    group_count: u32,
    /// Bits per full group; also the unit-number stride between groups.
    capacity: u32,
}

impl UnitAllocator {
    pub fn new(queue: Arc<Queue>, group_start: u32, group_count: u32) -> Result<Self> {
        if group_count == 0 {
            return Err(FsError::InvalidArgument(
                "allocator needs at least one bitmap group".into(),
            ));
        }
        let capacity = group_capacity(queue.extent_size());
        Ok(Self {
            queue,
            cursor: Mutex::new(0),
            group_start,
            group_count,
            capacity,
        })
    }

    /// Unit-number stride between groups.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Group the next allocation will try first.
    pub fn cursor(&self) -> u32 {
        *self.cursor.lock()
    }

    /// Resume searching from `group`, e.g. from a persisted hint at mount.
    pub fn set_cursor(&self, group: u32) -> Result<()> {
        if group >= self.group_count {
            return Err(FsError::InvalidArgument(format!(
                "cursor group {group} is past the last bitmap group"
            )));
        }
        *self.cursor.lock() = group;
        Ok(())
    }

    /// Initialize `group_count` group extents covering `total_units` units:
    /// zeroed bitmaps, full free counts, hints at zero. Written through
    /// synchronously.
    pub fn format(
        queue: &Queue,
        group_start: u32,
        group_count: u32,
        total_units: u64,
    ) -> Result<()> {
        let capacity = group_capacity(queue.extent_size());
        let needed = total_units.div_ceil(u64::from(capacity));
        if u64::from(group_count) < needed {
            return Err(FsError::InvalidArgument(format!(
                "{total_units} units need {needed} bitmap groups, got {group_count}"
            )));
        }

        let mut remaining = total_units;
        for g in 0..group_count {
            let total = remaining.min(u64::from(capacity)) as u32;
            remaining -= u64::from(total);

            let handle = queue.new_extent(group_start + g)?;
            {
                let mut data = handle.data();
                let header = GroupHeader::mut_from_prefix(&mut data)?;
                *header = GroupHeader::new(g, total);
            }
            handle.mark_dirty();
            handle.write_dirty()?;
            handle.put();
        }
        debug!(group_count, total_units, "formatted bitmap groups");
        Ok(())
    }

    /// Grant one free unit, marking it used on disk before returning.
    pub fn allocate(&self) -> Result<u32> {
        let mut cursor = self.cursor.lock();
        let start = *cursor;
        loop {
            let group = *cursor;
            if let Some(bit) = self.search_group(group)? {
                trace!(group, bit, "allocated unit");
                return Ok(group * self.capacity + bit);
            }
            *cursor = (group + 1) % self.group_count;
            if *cursor == start {
                debug!("every bitmap group is full");
                return Err(FsError::OutOfSpace);
            }
        }
    }

    /// Search one group from its position hint. Returns the granted bit, or
    /// `None` after resetting the hint for the next pass.
    fn search_group(&self, group: u32) -> Result<Option<u32>> {
        let handle = self.queue.read_extent(self.group_start + group)?;
        let (found, changed) = {
            let mut data = handle.data();
            let (head_bytes, bitmap_bytes) = data.split_at_mut(BITMAP_HEADER_SIZE);
            let header = GroupHeader::mut_from_prefix(head_bytes)?;
            let mut bitmap = Bitmap::new(bitmap_bytes, header.total_cnt())?;

            let hint = header.current_position();
            let from = if hint == 0 { None } else { Some(hint - 1) };
            let found = if header.free_cnt() == 0 {
                None
            } else {
                bitmap.next_clear_bit_after(from)
            };

            match found {
                Some(bit) => {
                    let was_set = bitmap.set(bit)?;
                    assert!(!was_set, "clear-bit scan returned a used bit");
                    header.set_free_cnt(header.free_cnt() - 1);
                    header.set_current_position(bit);
                    (Some(bit), true)
                }
                None => {
                    if hint != 0 {
                        header.set_current_position(0);
                    }
                    (None, hint != 0)
                }
            }
        };

        if changed {
            handle.mark_dirty();
            handle.write_dirty()?;
        }
        handle.put();
        Ok(found)
    }

    /// Return `unit` to the pool. With `sync` the group extent is written
    /// back before returning; otherwise it sits on the dirty list until the
    /// next flush. Freeing an already-free unit is a no-op.
    pub fn free(&self, unit: u32, sync: bool) -> Result<()> {
        let group = unit / self.capacity;
        let bit = unit % self.capacity;
        if group >= self.group_count {
            return Err(FsError::InvalidArgument(format!(
                "unit {unit} is past the last bitmap group"
            )));
        }

        let handle = self.queue.read_extent(self.group_start + group)?;
        let changed = {
            let mut data = handle.data();
            let (head_bytes, bitmap_bytes) = data.split_at_mut(BITMAP_HEADER_SIZE);
            let header = GroupHeader::mut_from_prefix(head_bytes)?;
            let mut bitmap = Bitmap::new(bitmap_bytes, header.total_cnt())?;

            if bitmap.clear(bit)? {
                header.set_free_cnt(header.free_cnt() + 1);
                true
            } else {
                false
            }
        };

        if changed {
            handle.mark_dirty();
            if sync {
                handle.write_dirty()?;
            }
            trace!(unit, group, bit, sync, "freed unit");
        }
        handle.put();
        Ok(())
    }

    /// Sum of the free counts across every group. Advisory: concurrent
    /// allocation can invalidate the answer immediately.
    pub fn free_units(&self) -> Result<u64> {
        let mut total = 0u64;
        for g in 0..self.group_count {
            let handle = self.queue.read_extent(self.group_start + g)?;
            {
                let data = handle.data();
                total += u64::from(GroupHeader::ref_from_prefix(&data)?.free_cnt());
            }
            handle.put();
        }
        Ok(total)
    }
}

fn group_capacity(extent_size: usize) -> u32 {
    ((extent_size - BITMAP_HEADER_SIZE) * 8) as u32
}
