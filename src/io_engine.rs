//! # I/O Engine
//!
//! Decouples cache fills and flushes from the calling thread. A fixed pool
//! of worker threads consumes a FIFO request queue; each worker performs one
//! positioned read or write at `extent_no * extent_size` on the backing
//! device and then completes the request, which clears the buffer's READING
//! or WRITING bit and wakes every thread blocked on that buffer.
//!
//! ## Submission Protocol
//!
//! ```text
//! cache thread                     worker thread
//! ------------                     -------------
//! set READING/WRITING
//! submit(dir, eno, buf) ──┐
//!   QUEUED already set?   │ no-op (one physical I/O per logical request)
//!   else set QUEUED,      │
//!   push + notify ────────┼──► pop request
//!                         │    lock buffer data, pread/pwrite
//! wait bit clear ◄────────┴──  complete: clear QUEUED + direction bit,
//!                              record error, notify_all
//! ```
//!
//! ## Shutdown
//!
//! Dropping the engine sets the stop flag and wakes every worker. A worker
//! only exits when the pending queue is empty, so requests already submitted
//! are drained, never abandoned.
//!
//! ## Ordering
//!
//! No ordering is guaranteed across distinct extents. For a single buffer
//! the cache never has a read and a write in flight simultaneously; the
//! buffer's data lock additionally serializes the physical transfers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::cache::ExtentBuffer;
use crate::config::{MAX_EXTENT_SIZE, MIN_EXTENT_SIZE};
use crate::device::ExtentDevice;
use crate::error::{FsError, Result};

/// Direction of one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoDir {
    Read,
    Write,
}

struct IoRequest {
    dir: IoDir,
    /// Absolute extent number; the cache applies its base before submitting.
    extent_no: u32,
    buf: Arc<ExtentBuffer>,
}

struct EngineShared {
    device: Arc<dyn ExtentDevice>,
    extent_size: usize,
    pending: Mutex<VecDeque<IoRequest>>,
    pending_cond: Condvar,
    stop: AtomicBool,
}

/// Worker-thread pool driving an [`ExtentDevice`].
pub struct IoEngine {
    shared: Arc<EngineShared>,
    workers: Vec<JoinHandle<()>>,
}

impl IoEngine {
    /// Spawn `workers` threads over `device` with the given extent size.
    pub fn new(
        device: Arc<dyn ExtentDevice>,
        extent_size: usize,
        workers: usize,
    ) -> Result<IoEngine> {
        if !extent_size.is_power_of_two()
            || !(MIN_EXTENT_SIZE..=MAX_EXTENT_SIZE).contains(&extent_size)
        {
            return Err(FsError::InvalidArgument(format!(
                "extent size {extent_size} outside [{MIN_EXTENT_SIZE}, {MAX_EXTENT_SIZE}] or not a power of two"
            )));
        }
        if workers == 0 {
            return Err(FsError::InvalidArgument(
                "I/O engine needs at least one worker".into(),
            ));
        }

        let shared = Arc::new(EngineShared {
            device,
            extent_size,
            pending: Mutex::new(VecDeque::new()),
            pending_cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let handles = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("extentfs-io-{id}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|_| FsError::OutOfMemory)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(IoEngine {
            shared,
            workers: handles,
        })
    }

    pub fn extent_size(&self) -> usize {
        self.shared.extent_size
    }

    pub fn device(&self) -> &Arc<dyn ExtentDevice> {
        &self.shared.device
    }

    /// Queue one read or write for `extent_no`. Idempotent: a buffer already
    /// queued is not queued twice, so one logical request maps to at most one
    /// physical I/O.
    pub(crate) fn submit(&self, dir: IoDir, extent_no: u32, buf: Arc<ExtentBuffer>) {
        if !buf.try_set_queued() {
            trace!(extent_no, "submit skipped, buffer already queued");
            return;
        }

        let mut pending = self.shared.pending.lock();
        pending.push_back(IoRequest {
            dir,
            extent_no,
            buf,
        });
        drop(pending);
        self.shared.pending_cond.notify_one();
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending_cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("I/O engine stopped");
    }
}

fn worker_loop(shared: &EngineShared) {
    loop {
        let req = {
            let mut pending = shared.pending.lock();
            loop {
                if let Some(req) = pending.pop_front() {
                    break req;
                }
                // Drain before exit: stop is only honored on an empty queue.
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                shared.pending_cond.wait(&mut pending);
            }
        };
        perform(shared, &req);
    }
}

fn perform(shared: &EngineShared, req: &IoRequest) {
    let offset = u64::from(req.extent_no) * shared.extent_size as u64;
    let result = match req.dir {
        IoDir::Read => {
            let mut data = req.buf.lock_data();
            shared.device.read_at(offset, &mut data)
        }
        IoDir::Write => {
            let data = req.buf.lock_data();
            shared.device.write_at(offset, &data)
        }
    };
    trace!(extent_no = req.extent_no, dir = ?req.dir, ok = result.is_ok(), "I/O complete");
    req.buf.io_complete(req.dir, req.extent_no, result);
}
