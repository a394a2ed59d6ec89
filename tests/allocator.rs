//! Volume-level allocation behavior: exhaustion, reuse after free, cursor
//! persistence, and allocation under thread contention.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use extentfs::{
    ExtentDevice, FormatOptions, FsContext, FsError, MemDevice, MountOptions,
};

const EXTENT_SIZE: usize = 4096;

fn formatted_device(extents: usize) -> Arc<MemDevice> {
    let dev = MemDevice::new(EXTENT_SIZE * extents);
    FsContext::format(
        Arc::clone(&dev) as Arc<dyn ExtentDevice>,
        FormatOptions::default(),
    )
    .unwrap();
    dev
}

fn mount(dev: &Arc<MemDevice>) -> FsContext {
    FsContext::mount(
        Arc::clone(dev) as Arc<dyn ExtentDevice>,
        MountOptions::default(),
    )
    .unwrap()
}

#[test]
fn volume_exhaustion_and_reuse() {
    // 64 extents: 2 reserved, 1 bitmap group, 61 data extents.
    let dev = formatted_device(64);
    let ctx = mount(&dev);

    let total = ctx.free_extents().unwrap();
    assert_eq!(total, 61);

    let mut granted = Vec::new();
    for _ in 0..total {
        granted.push(ctx.allocate_extent().unwrap());
    }
    assert!(matches!(ctx.allocate_extent(), Err(FsError::OutOfSpace)));

    // Grants are dense and unique.
    let unique: HashSet<_> = granted.iter().copied().collect();
    assert_eq!(unique.len(), granted.len());

    ctx.free_extent(granted[5], true).unwrap();
    assert_eq!(ctx.allocate_extent().unwrap(), granted[5]);
    assert!(matches!(ctx.allocate_extent(), Err(FsError::OutOfSpace)));
    ctx.unmount().unwrap();
}

#[test]
fn allocations_persist_across_remount() {
    let dev = formatted_device(64);

    let taken = {
        let ctx = mount(&dev);
        let taken: Vec<u32> = (0..10).map(|_| ctx.allocate_extent().unwrap()).collect();
        ctx.unmount().unwrap();
        taken
    };

    let ctx = mount(&dev);
    assert_eq!(ctx.free_extents().unwrap(), 51);
    let next = ctx.allocate_extent().unwrap();
    assert!(!taken.contains(&next));
    ctx.unmount().unwrap();
}

#[test]
fn deferred_frees_reach_disk_on_sync() {
    let dev = formatted_device(64);
    let ctx = mount(&dev);

    let extents: Vec<u32> = (0..5).map(|_| ctx.allocate_extent().unwrap()).collect();
    ctx.sync().unwrap();
    for &e in &extents {
        ctx.free_extent(e, false).unwrap();
    }
    ctx.sync().unwrap();
    ctx.unmount().unwrap();

    let ctx = mount(&dev);
    assert_eq!(ctx.free_extents().unwrap(), 61);
    ctx.unmount().unwrap();
}

#[test]
fn concurrent_allocation_grants_unique_extents() {
    let dev = formatted_device(64);
    let ctx = Arc::new(mount(&dev));

    let threads = 4;
    let per_thread = 15;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                for _ in 0..per_thread {
                    mine.push(ctx.allocate_extent().unwrap());
                }
                mine
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread);

    let ctx = Arc::into_inner(ctx).unwrap();
    ctx.unmount().unwrap();
}

#[test]
fn data_written_to_allocated_extent_round_trips() {
    let dev = formatted_device(64);

    let extent = {
        let ctx = mount(&dev);
        let extent = ctx.allocate_extent().unwrap();
        let handle = ctx.new_data_extent(extent).unwrap();
        handle.data().fill(0x3C);
        handle.mark_dirty();
        handle.put();
        ctx.unmount().unwrap();
        extent
    };

    let ctx = mount(&dev);
    let handle = ctx.read_data_extent(extent).unwrap();
    assert!(handle.data().iter().all(|&b| b == 0x3C));
    handle.put();
    ctx.unmount().unwrap();
}

#[test]
fn garbage_volume_is_rejected() {
    let dev = MemDevice::new(EXTENT_SIZE * 64);
    dev.write_at(4096, &[0x55; 4096]).unwrap();

    let err = FsContext::mount(
        Arc::clone(&dev) as Arc<dyn ExtentDevice>,
        MountOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, FsError::Format(_)));
}
