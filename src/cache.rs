//! # Extent Buffer Cache
//!
//! A bounded, reference-counted cache of extent-sized buffers shared by every
//! metadata and data path in the filesystem. One [`Queue`] instance manages
//! one contiguous extent address space (the metadata area or the data area).
//!
//! ## Structure
//!
//! ```text
//! Queue
//! ├── index: HashMap<extent_no, CacheEntry>     (hash lookup)
//! ├── lru[CLEAN]: VecDeque<extent_no>           (front = coldest)
//! ├── lru[DIRTY]: VecDeque<extent_no>
//! ├── reserved: Vec<Arc<ExtentBuffer>>          (free buffer pool)
//! └── free_cond                                  (woken when a hold drops to 0)
//! ```
//!
//! Every cached buffer is in the index and on exactly one LRU list; the list
//! mirrors its DIRTY bit. The pool is fixed at construction: the cache never
//! allocates buffer memory afterwards, so a caller that holds every buffer
//! at once blocks further allocation until it puts one back.
//!
//! ## Hold Counts
//!
//! `read_extent`/`new_extent` return a [`BufferHandle`] and count one hold.
//! A buffer can only be evicted or recycled when its hold count is zero and
//! no I/O is in flight. `put` drops the hold and leaves the buffer cached;
//! `release` additionally unlinks a fully clean buffer immediately, for
//! extents the caller knows will not be touched again soon.
//!
//! ## Miss Path
//!
//! On a miss the new buffer is linked into the index and the CLEAN list
//! *before* the queue lock is dropped, and the insert is re-checked after any
//! blocking wait for a free buffer. Together these guarantee at most one
//! physical read in flight per extent number and exactly one cached buffer
//! per key at any instant.
//!
//! ## Locking
//!
//! One queue-wide lock protects the index, both LRU lists, the pool, and all
//! hold counts. Each buffer has a small state lock (READING/WRITING/DIRTY/
//! QUEUED bits plus the last I/O error) paired with a condvar for completion
//! waits, and a separate data lock giving holders exclusive access to the
//! bytes. Lock order is queue state, then buffer state. A physical transfer
//! holds the buffer's data lock, and a handle holder may be sitting on that
//! same lock, so a thread holding the queue lock must never wait for a
//! completion on a buffer that can have holders: starting a write-back is
//! always non-blocking (a buffer whose previous write is still in flight
//! keeps its DIRTY bit for a later round), completion waits happen with the
//! queue lock released, and the only in-queue-lock waits are on hold-zero
//! buffers, which the workers alone can satisfy.
//!
//! ## Failure Semantics
//!
//! An I/O error is recorded on the buffer and surfaced to the first caller
//! that observes it; a failed fill is not left cached. The cache never
//! retries I/O. Bookkeeping divergence (hold underflow, completion of an I/O
//! that was never started, dirtying a buffer mid-read) panics immediately.
//!
//! ## Background Cleaner
//!
//! One thread per queue wakes on a fixed interval, try-locks the queue (a
//! contended round is skipped entirely), and evicts idle buffers from the
//! cold end of each list until it meets one that is too young or still held.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::{BUFFER_MAX_AGE, CLEANER_INTERVAL, DEFAULT_RESERVED_BUFFERS};
use crate::error::{FsError, Result};
use crate::io_engine::{IoDir, IoEngine};

pub(crate) const B_READING: u8 = 1 << 0;
pub(crate) const B_WRITING: u8 = 1 << 1;
pub(crate) const B_DIRTY: u8 = 1 << 2;
pub(crate) const B_QUEUED: u8 = 1 << 3;

const IN_FLIGHT: u8 = B_READING | B_WRITING | B_QUEUED;

/// Outcome of [`ExtentBuffer::start_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStart {
    /// DIRTY moved to WRITING; the caller must submit the write.
    Started,
    /// A previous write is still in flight. DIRTY, if set, stays set and a
    /// later write-back round picks the buffer up again.
    Pending,
    /// Nothing to write and nothing in flight.
    Idle,
}

/// One cached extent image plus its I/O state.
///
/// The state lock carries the bit set and last error; the condvar is
/// broadcast whenever a bit clears. The data lock hands holders exclusive
/// byte access and serializes the physical transfer against mutation.
pub(crate) struct ExtentBuffer {
    flags: Mutex<BufFlags>,
    cond: Condvar,
    data: Mutex<Box<[u8]>>,
}

struct BufFlags {
    bits: u8,
    error: Option<String>,
}

impl ExtentBuffer {
    fn with_capacity(extent_size: usize) -> Self {
        Self {
            flags: Mutex::new(BufFlags {
                bits: 0,
                error: None,
            }),
            cond: Condvar::new(),
            data: Mutex::new(vec![0u8; extent_size].into_boxed_slice()),
        }
    }

    pub(crate) fn lock_data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// Called by an I/O worker once the transfer finishes.
    pub(crate) fn io_complete(&self, dir: IoDir, extent_no: u32, result: io::Result<()>) {
        let bit = match dir {
            IoDir::Read => B_READING,
            IoDir::Write => B_WRITING,
        };
        let mut flags = self.flags.lock();
        assert!(
            flags.bits & bit != 0,
            "completion of an I/O that was never started (extent {extent_no})"
        );
        flags.bits &= !(bit | B_QUEUED);
        if let Err(err) = result {
            flags.error = Some(err.to_string());
        }
        drop(flags);
        self.cond.notify_all();
    }

    pub(crate) fn try_set_queued(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.bits & B_QUEUED != 0 {
            return false;
        }
        flags.bits |= B_QUEUED;
        true
    }

    fn test_any(&self, mask: u8) -> bool {
        self.flags.lock().bits & mask != 0
    }

    /// Block until `bit` is clear.
    fn wait_bit_clear(&self, bit: u8) {
        let mut flags = self.flags.lock();
        while flags.bits & bit != 0 {
            self.cond.wait(&mut flags);
        }
    }

    /// Atomically hand DIRTY over to WRITING. Never waits, so it is safe to
    /// call with the queue lock held.
    fn start_write(&self) -> WriteStart {
        let mut flags = self.flags.lock();
        if flags.bits & B_WRITING != 0 {
            return WriteStart::Pending;
        }
        if flags.bits & B_DIRTY == 0 {
            return WriteStart::Idle;
        }
        flags.bits &= !B_DIRTY;
        flags.bits |= B_WRITING;
        WriteStart::Started
    }

    /// Returns true if DIRTY was newly set.
    fn set_dirty(&self) -> bool {
        let mut flags = self.flags.lock();
        assert!(
            flags.bits & B_READING == 0,
            "dirtying a buffer whose fill is still in flight"
        );
        if flags.bits & B_DIRTY != 0 {
            return false;
        }
        flags.bits |= B_DIRTY;
        true
    }

    fn take_error(&self) -> Option<String> {
        self.flags.lock().error.take()
    }

    /// Bind a pooled buffer to a new extent. Fresh buffers start zeroed with
    /// no pending fill; read buffers start with READING set.
    fn bind(&self, fresh: bool) {
        let mut flags = self.flags.lock();
        debug_assert_eq!(flags.bits & IN_FLIGHT, 0);
        flags.bits = if fresh { 0 } else { B_READING };
        flags.error = None;
        drop(flags);
        if fresh {
            self.lock_data().fill(0);
        }
    }

    fn reset_for_pool(&self) {
        let mut flags = self.flags.lock();
        assert_eq!(
            flags.bits & IN_FLIGHT,
            0,
            "recycling a buffer with I/O in flight"
        );
        flags.bits = 0;
        flags.error = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Clean = 0,
    Dirty = 1,
}

struct CacheEntry {
    buf: Arc<ExtentBuffer>,
    hold_cnt: u32,
    list: ListKind,
    last_accessed: Instant,
}

struct QueueState {
    index: HashMap<u32, CacheEntry>,
    lru: [VecDeque<u32>; 2],
    reserved: Vec<Arc<ExtentBuffer>>,
    /// How many buffers the pool still owes itself; incremented when a
    /// reserved buffer is taken, decremented when one is put back.
    need_reserved: usize,
}

struct QueueShared {
    state: Mutex<QueueState>,
    free_cond: Condvar,
    engine: Arc<IoEngine>,
    extent_base: u32,
    max_age: Duration,
    cleaner_interval: Duration,
    cleaner_stop: Mutex<bool>,
    cleaner_cond: Condvar,
}

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total buffers in the pool; also the cap on concurrently held handles.
    pub reserved_buffers: usize,
    /// Added to every extent number before it reaches the device, so a queue
    /// can manage a sub-range (e.g. the data area) with 0-based numbers.
    pub extent_base: u32,
    /// Idle age beyond which the background cleaner evicts a buffer.
    pub max_age: Duration,
    /// Cleaner wakeup period.
    pub cleaner_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reserved_buffers: DEFAULT_RESERVED_BUFFERS,
            extent_base: 0,
            max_age: BUFFER_MAX_AGE,
            cleaner_interval: CLEANER_INTERVAL,
        }
    }
}

/// The extent buffer cache.
pub struct Queue {
    shared: Arc<QueueShared>,
    cleaner: Option<JoinHandle<()>>,
}

impl Queue {
    /// Build a cache over `engine` with a fully preallocated buffer pool.
    /// Fails atomically: nothing is spawned if any allocation step fails.
    pub fn create(engine: Arc<IoEngine>, config: QueueConfig) -> Result<Queue> {
        if config.reserved_buffers == 0 {
            return Err(FsError::InvalidArgument(
                "queue needs at least one reserved buffer".into(),
            ));
        }

        let extent_size = engine.extent_size();
        let mut reserved = Vec::new();
        reserved.try_reserve_exact(config.reserved_buffers)?;
        for _ in 0..config.reserved_buffers {
            reserved.push(Arc::new(ExtentBuffer::with_capacity(extent_size)));
        }

        let mut index = HashMap::new();
        index
            .try_reserve(config.reserved_buffers)
            .map_err(|_| FsError::OutOfMemory)?;

        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                index,
                lru: [VecDeque::new(), VecDeque::new()],
                reserved,
                need_reserved: 0,
            }),
            free_cond: Condvar::new(),
            engine,
            extent_base: config.extent_base,
            max_age: config.max_age,
            cleaner_interval: config.cleaner_interval,
            cleaner_stop: Mutex::new(false),
            cleaner_cond: Condvar::new(),
        });

        let cleaner = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("extentfs-cleaner".into())
                .spawn(move || cleaner_loop(&shared))
                .map_err(|_| FsError::OutOfMemory)?
        };

        Ok(Queue {
            shared,
            cleaner: Some(cleaner),
        })
    }

    /// Bind a buffer to `extent_no` without reading the device. The caller
    /// intends to overwrite the whole extent; content starts zeroed.
    pub fn new_extent(&self, extent_no: u32) -> Result<BufferHandle> {
        extent_get(&self.shared, extent_no, true)
    }

    /// Return a buffer with valid content for `extent_no`, reading the
    /// device on a miss.
    pub fn read_extent(&self, extent_no: u32) -> Result<BufferHandle> {
        extent_get(&self.shared, extent_no, false)
    }

    /// Submit non-blocking writes for every buffer on the DIRTY list,
    /// starting from its cold end. Used for periodic background flush.
    pub fn write_dirty_async(&self) {
        let mut state = self.shared.state.lock();
        flush_dirty_list(&self.shared, &mut state);
    }

    /// Flush the whole DIRTY list and wait the writes out. The first
    /// recorded write error is returned; the rest of the list is still
    /// processed.
    pub fn flush(&self) -> Result<()> {
        // Snapshot the targets, then wait with the queue unlocked so that a
        // holder sitting on a data lock can still reach mark_dirty.
        let targets: Vec<(u32, Arc<ExtentBuffer>)> = {
            let mut state = self.shared.state.lock();
            flush_dirty_list(&self.shared, &mut state);
            state.lru[ListKind::Dirty as usize]
                .iter()
                .map(|&eno| (eno, Arc::clone(&state.index[&eno].buf)))
                .collect()
        };

        let mut first_err = None;
        for (eno, buf) in targets {
            loop {
                buf.wait_bit_clear(B_WRITING);
                if let Some(detail) = buf.take_error() {
                    first_err.get_or_insert(FsError::Device {
                        extent: eno,
                        detail,
                    });
                }

                let mut state = self.shared.state.lock();
                // The buffer may have been evicted and rebound meanwhile;
                // only touch the instance this flush actually targeted.
                let ours = state
                    .index
                    .get(&eno)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.buf, &buf));
                if !ours {
                    break;
                }
                match start_dirty_write(&self.shared, eno, &buf) {
                    WriteStart::Idle => {
                        relink(&mut state, eno, ListKind::Clean);
                        break;
                    }
                    // Deferred earlier or re-dirtied since: wait this write
                    // out too before declaring the buffer flushed.
                    WriteStart::Started | WriteStart::Pending => {}
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Size in bytes of every buffer managed by this queue.
    pub fn extent_size(&self) -> usize {
        self.shared.engine.extent_size()
    }

    /// Number of buffers currently cached (indexed by key).
    pub fn cached(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    /// Panic if the cache bookkeeping has diverged: every indexed buffer on
    /// exactly one list, list membership matching the DIRTY/WRITING bits,
    /// and no dirty buffer on the CLEAN list.
    pub fn check_invariants(&self) {
        let state = self.shared.state.lock();
        let listed: usize = state.lru.iter().map(VecDeque::len).sum();
        assert_eq!(listed, state.index.len(), "index and LRU lists disagree");

        for (li, lru) in state.lru.iter().enumerate() {
            for eno in lru {
                let entry = state
                    .index
                    .get(eno)
                    .expect("LRU references an extent missing from the index");
                assert_eq!(entry.list as usize, li, "entry on the wrong LRU list");
                if li == ListKind::Clean as usize {
                    assert!(
                        !entry.buf.test_any(B_DIRTY),
                        "dirty buffer on the CLEAN list"
                    );
                }
            }
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        *self.shared.cleaner_stop.lock() = true;
        self.shared.cleaner_cond.notify_all();
        if let Some(handle) = self.cleaner.take() {
            let _ = handle.join();
        }

        // Flush what is dirty and drain every idle buffer back to the pool.
        let mut state = self.shared.state.lock();
        flush_dirty_list(&self.shared, &mut state);
        while let Some((eno, buf)) = get_unclaimed(&self.shared, &mut state) {
            trace!(extent_no = eno, "dropping buffer at queue shutdown");
            return_to_pool(&self.shared, &mut state, buf);
        }
        debug!(remaining = state.index.len(), "queue shut down");
    }
}

/// A counted reference to one cached buffer.
///
/// Dropping the handle is equivalent to [`BufferHandle::put`]; `release`
/// must be requested explicitly.
pub struct BufferHandle {
    shared: Arc<QueueShared>,
    buf: Arc<ExtentBuffer>,
    extent_no: u32,
    consumed: bool,
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("extent_no", &self.extent_no)
            .finish_non_exhaustive()
    }
}

impl BufferHandle {
    pub fn extent_no(&self) -> u32 {
        self.extent_no
    }

    /// Exclusive access to the extent bytes. The holder is expected to be
    /// the only writer of the ranges it mutates; the lock also keeps an
    /// in-flight write from observing a half-applied mutation.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.buf.lock_data(), |data| &mut data[..])
    }

    /// Set DIRTY and move the buffer to the DIRTY list. Must not be called
    /// while a fill is in flight.
    pub fn mark_dirty(&self) {
        let mut state = self.shared.state.lock();
        if self.buf.set_dirty() {
            relink(&mut state, self.extent_no, ListKind::Dirty);
        }
    }

    /// Synchronously write the buffer back if dirty, then relink it CLEAN.
    /// If a previous write is still in flight it is waited out first (with
    /// the queue lock released) and the write-back retried.
    pub fn write_dirty(&self) -> Result<()> {
        let mut first_err = None;
        loop {
            let action = {
                let _state = self.shared.state.lock();
                assert!(
                    !self.buf.test_any(B_READING),
                    "write_dirty on a buffer mid-read"
                );
                start_dirty_write(&self.shared, self.extent_no, &self.buf)
            };
            if action == WriteStart::Idle {
                break;
            }
            self.buf.wait_bit_clear(B_WRITING);
            if let Some(detail) = self.buf.take_error() {
                first_err.get_or_insert(detail);
            }
        }

        let mut state = self.shared.state.lock();
        if !self.buf.test_any(B_DIRTY | B_WRITING) {
            relink(&mut state, self.extent_no, ListKind::Clean);
        }
        drop(state);

        match first_err {
            Some(detail) => Err(FsError::Device {
                extent: self.extent_no,
                detail,
            }),
            None => Ok(()),
        }
    }

    /// Drop this hold. The buffer stays cached.
    pub fn put(mut self) {
        self.consumed = true;
        put_inner(&self.shared, self.extent_no);
    }

    /// Drop this hold, and if the buffer is now idle and fully clean, unlink
    /// it immediately and return it to the pool. For extents that will not
    /// be reused soon, this avoids polluting the cache.
    pub fn release(mut self) {
        self.consumed = true;
        release_inner(&self.shared, self.extent_no);
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !self.consumed {
            put_inner(&self.shared, self.extent_no);
        }
    }
}

fn lru_remove(lru: &mut VecDeque<u32>, eno: u32) {
    if let Some(pos) = lru.iter().position(|&e| e == eno) {
        lru.remove(pos);
    }
}

/// Move a buffer to the MRU end of `target`, switching lists if needed.
fn relink(state: &mut QueueState, eno: u32, target: ListKind) {
    let Some(entry) = state.index.get_mut(&eno) else {
        return;
    };
    let current = entry.list;
    entry.list = target;
    lru_remove(&mut state.lru[current as usize], eno);
    state.lru[target as usize].push_back(eno);
}

fn unlink(state: &mut QueueState, eno: u32) {
    if let Some(entry) = state.index.remove(&eno) {
        lru_remove(&mut state.lru[entry.list as usize], eno);
    }
}

fn return_to_pool(shared: &QueueShared, state: &mut QueueState, buf: Arc<ExtentBuffer>) {
    buf.reset_for_pool();
    if state.need_reserved > 0 {
        state.reserved.push(buf);
        state.need_reserved -= 1;
    }
    shared.free_cond.notify_one();
}

/// Start a write-back if the buffer is dirty and none is in flight, and
/// submit it. Never blocks, so it is safe with the queue lock held.
fn start_dirty_write(shared: &QueueShared, eno: u32, buf: &Arc<ExtentBuffer>) -> WriteStart {
    let action = buf.start_write();
    if action == WriteStart::Started {
        shared
            .engine
            .submit(IoDir::Write, shared.extent_base + eno, Arc::clone(buf));
    }
    action
}

/// Wait out any fill, flush until clean, wait the writes out. Only legal on
/// a buffer with a zero hold count: the waits here can only be satisfied by
/// the I/O workers, never by a handle holder.
fn make_buffer_clean(shared: &QueueShared, eno: u32, buf: &Arc<ExtentBuffer>) {
    buf.wait_bit_clear(B_READING);
    while start_dirty_write(shared, eno, buf) != WriteStart::Idle {
        buf.wait_bit_clear(B_WRITING);
    }
}

/// Find a reusable buffer: coldest unheld CLEAN buffer first, then coldest
/// unheld DIRTY buffer (synchronously written back). Returns `None` when
/// every buffer is held.
fn get_unclaimed(shared: &QueueShared, state: &mut QueueState) -> Option<(u32, Arc<ExtentBuffer>)> {
    for list in [ListKind::Clean, ListKind::Dirty] {
        let mut found = None;
        for &eno in &state.lru[list as usize] {
            let entry = &state.index[&eno];
            if entry.hold_cnt == 0 {
                found = Some((eno, Arc::clone(&entry.buf)));
                break;
            }
        }
        if let Some((eno, buf)) = found {
            make_buffer_clean(shared, eno, &buf);
            unlink(state, eno);
            trace!(extent_no = eno, list = ?list, "evicted buffer for reuse");
            return Some((eno, buf));
        }
    }
    None
}

/// Take a buffer from the reserved pool, or evict one, or block on the
/// free-buffer condition and retry from the top once woken.
fn alloc_buffer_wait<'a>(
    shared: &QueueShared,
    state: &mut MutexGuard<'a, QueueState>,
) -> Arc<ExtentBuffer> {
    loop {
        if let Some(buf) = state.reserved.pop() {
            state.need_reserved += 1;
            return buf;
        }
        if let Some((_, buf)) = get_unclaimed(shared, state) {
            return buf;
        }
        shared.free_cond.wait(state);
    }
}

/// One non-blocking write-back pass over the DIRTY list, cold end first.
/// Buffers with a write already in flight are left in place for a later
/// round; buffers that turned out fully clean are relinked.
fn flush_dirty_list(shared: &QueueShared, state: &mut QueueState) {
    let enos: SmallVec<[u32; 16]> = state.lru[ListKind::Dirty as usize]
        .iter()
        .copied()
        .collect();
    for eno in enos {
        let Some(entry) = state.index.get(&eno) else {
            continue;
        };
        if entry.list != ListKind::Dirty {
            continue;
        }
        let buf = Arc::clone(&entry.buf);
        assert!(
            !buf.test_any(B_READING),
            "buffer on the dirty list is mid-read"
        );
        if start_dirty_write(shared, eno, &buf) == WriteStart::Idle {
            relink(state, eno, ListKind::Clean);
        }
    }
}

fn extent_get(shared: &Arc<QueueShared>, eno: u32, fresh: bool) -> Result<BufferHandle> {
    let (buf, need_submit, zero_on_hit) = {
        let mut state = shared.state.lock();
        loop {
            if let Some(entry) = state.index.get_mut(&eno) {
                entry.hold_cnt += 1;
                entry.last_accessed = Instant::now();
                let buf = Arc::clone(&entry.buf);
                let target = if buf.test_any(B_DIRTY | B_WRITING) {
                    ListKind::Dirty
                } else {
                    ListKind::Clean
                };
                relink(&mut state, eno, target);
                break (buf, false, fresh);
            }

            let buf = alloc_buffer_wait(shared, &mut state);
            // The wait drops the queue lock, so another thread may have
            // inserted this key meanwhile; if so, attach to the winner.
            if state.index.contains_key(&eno) {
                return_to_pool(shared, &mut state, buf);
                continue;
            }

            buf.bind(fresh);
            state.index.insert(
                eno,
                CacheEntry {
                    buf: Arc::clone(&buf),
                    hold_cnt: 1,
                    list: ListKind::Clean,
                    last_accessed: Instant::now(),
                },
            );
            state.lru[ListKind::Clean as usize].push_back(eno);
            trace!(extent_no = eno, fresh, "bound buffer on miss");
            break (buf, !fresh, false);
        }
    };

    if need_submit {
        shared
            .engine
            .submit(IoDir::Read, shared.extent_base + eno, Arc::clone(&buf));
    }

    buf.wait_bit_clear(B_READING);

    // A fresh request that hit the cache still gets zeroed content. Let an
    // in-flight write of the old bytes finish first so its transfer is not
    // torn, then clear under the data lock.
    if zero_on_hit {
        buf.wait_bit_clear(B_WRITING);
        buf.lock_data().fill(0);
    }

    if let Some(detail) = buf.take_error() {
        // A failed fill must not stay cached.
        release_inner(shared, eno);
        return Err(FsError::Device {
            extent: eno,
            detail,
        });
    }

    Ok(BufferHandle {
        shared: Arc::clone(shared),
        buf,
        extent_no: eno,
        consumed: false,
    })
}

fn put_inner(shared: &QueueShared, eno: u32) {
    let mut state = shared.state.lock();
    let entry = state
        .index
        .get_mut(&eno)
        .expect("put on an extent missing from the index");
    assert!(entry.hold_cnt > 0, "hold count underflow");
    entry.hold_cnt -= 1;
    if entry.hold_cnt == 0 {
        shared.free_cond.notify_one();
    }
}

fn release_inner(shared: &QueueShared, eno: u32) {
    let mut state = shared.state.lock();
    let entry = state
        .index
        .get_mut(&eno)
        .expect("release on an extent missing from the index");
    assert!(entry.hold_cnt > 0, "hold count underflow");
    entry.hold_cnt -= 1;
    if entry.hold_cnt == 0 {
        shared.free_cond.notify_one();
        let buf = Arc::clone(&entry.buf);
        if !buf.test_any(B_READING | B_WRITING | B_DIRTY) {
            unlink(&mut state, eno);
            return_to_pool(shared, &mut state, buf);
        }
    }
}

fn cleaner_loop(shared: &Arc<QueueShared>) {
    loop {
        {
            let mut stop = shared.cleaner_stop.lock();
            if *stop {
                return;
            }
            shared
                .cleaner_cond
                .wait_for(&mut stop, shared.cleaner_interval);
            if *stop {
                return;
            }
        }

        // Skip the whole round rather than stall foreground I/O.
        let Some(mut state) = shared.state.try_lock() else {
            continue;
        };
        for list in [ListKind::Clean, ListKind::Dirty] {
            loop {
                let Some(&eno) = state.lru[list as usize].front() else {
                    break;
                };
                let entry = &state.index[&eno];
                if entry.hold_cnt > 0 || entry.last_accessed.elapsed() < shared.max_age {
                    break;
                }
                let buf = Arc::clone(&entry.buf);
                make_buffer_clean(shared, eno, &buf);
                unlink(&mut state, eno);
                return_to_pool(shared, &mut state, buf);
                trace!(extent_no = eno, "cleaner evicted aged buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ExtentDevice, MemDevice};

    const EXTENT_SIZE: usize = 4096;

    fn test_queue(buffers: usize) -> (Queue, Arc<MemDevice>) {
        let dev = MemDevice::new(EXTENT_SIZE * 64);
        let engine = Arc::new(
            IoEngine::new(
                Arc::clone(&dev) as Arc<dyn crate::device::ExtentDevice>,
                EXTENT_SIZE,
                2,
            )
            .unwrap(),
        );
        let queue = Queue::create(
            engine,
            QueueConfig {
                reserved_buffers: buffers,
                ..QueueConfig::default()
            },
        )
        .unwrap();
        (queue, dev)
    }

    #[test]
    fn read_miss_fills_from_device() {
        let (queue, dev) = test_queue(4);
        dev.write_at(3 * EXTENT_SIZE as u64, &[0x5A; EXTENT_SIZE])
            .unwrap();

        let handle = queue.read_extent(3).unwrap();
        assert_eq!(handle.data()[0], 0x5A);
        assert_eq!(dev.read_count(), 1);
        handle.put();

        // Hit: no second physical read.
        let handle = queue.read_extent(3).unwrap();
        assert_eq!(dev.read_count(), 1);
        handle.put();
        queue.check_invariants();
    }

    #[test]
    fn new_extent_is_zeroed_and_reads_nothing() {
        let (queue, dev) = test_queue(4);
        dev.write_at(0, &[0xFF; EXTENT_SIZE]).unwrap();

        let handle = queue.new_extent(0).unwrap();
        assert!(handle.data().iter().all(|&b| b == 0));
        assert_eq!(dev.read_count(), 0);
        handle.put();
    }

    #[test]
    fn new_extent_zeroes_a_cached_hit() {
        let (queue, dev) = test_queue(4);
        dev.write_at(3 * EXTENT_SIZE as u64, &[0x77; EXTENT_SIZE])
            .unwrap();

        let handle = queue.read_extent(3).unwrap();
        assert_eq!(handle.data()[0], 0x77);
        handle.put();

        // Still cached; the fresh request must not expose the old bytes.
        let handle = queue.new_extent(3).unwrap();
        assert!(handle.data().iter().all(|&b| b == 0));
        assert_eq!(dev.read_count(), 1);
        handle.put();
        queue.check_invariants();
    }

    #[test]
    fn dirty_write_back_round_trips() {
        let (queue, dev) = test_queue(4);

        let handle = queue.new_extent(7).unwrap();
        handle.data()[..4].copy_from_slice(&[1, 2, 3, 4]);
        handle.mark_dirty();
        handle.write_dirty().unwrap();
        handle.put();
        queue.check_invariants();

        let image = dev.snapshot();
        assert_eq!(&image[7 * EXTENT_SIZE..7 * EXTENT_SIZE + 4], &[1, 2, 3, 4]);
    }

    #[test]
    fn mark_dirty_twice_links_once() {
        let (queue, _dev) = test_queue(4);

        let handle = queue.new_extent(1).unwrap();
        handle.mark_dirty();
        handle.mark_dirty();
        {
            let state = queue.shared.state.lock();
            let on_dirty = state.lru[ListKind::Dirty as usize]
                .iter()
                .filter(|&&e| e == 1)
                .count();
            assert_eq!(on_dirty, 1);
            assert!(state.lru[ListKind::Clean as usize].is_empty());
        }
        handle.write_dirty().unwrap();
        handle.put();
        queue.check_invariants();
    }

    #[test]
    fn async_write_back_lands_by_the_next_flush() {
        let (queue, dev) = test_queue(4);

        let handle = queue.new_extent(2).unwrap();
        handle.data()[0] = 0x11;
        handle.mark_dirty();
        handle.put();

        queue.write_dirty_async();
        queue.flush().unwrap();
        assert_eq!(dev.snapshot()[2 * EXTENT_SIZE], 0x11);
        queue.check_invariants();
    }

    #[test]
    fn background_flush_never_blocks_behind_an_in_flight_write() {
        let (queue, dev) = test_queue(4);

        let handle = queue.new_extent(1).unwrap();
        handle.data()[0] = 1;
        handle.mark_dirty();

        // Keep the worker stuck on the data lock while its write is in
        // flight, the way a holder mutating the bytes would.
        let guard = handle.data();
        queue.write_dirty_async();
        handle.mark_dirty();
        // A second round with that write still pending must return without
        // waiting under the queue lock, and the queue lock must stay
        // reachable for mark_dirty; both hang forever otherwise.
        queue.write_dirty_async();
        handle.mark_dirty();
        drop(guard);

        handle.write_dirty().unwrap();
        handle.put();
        assert_eq!(dev.snapshot()[EXTENT_SIZE], 1);
        queue.check_invariants();
    }

    #[test]
    fn duplicate_submission_performs_one_physical_write() {
        let dev = MemDevice::new(EXTENT_SIZE * 8);
        let engine = IoEngine::new(
            Arc::clone(&dev) as Arc<dyn ExtentDevice>,
            EXTENT_SIZE,
            2,
        )
        .unwrap();

        let buf = Arc::new(ExtentBuffer::with_capacity(EXTENT_SIZE));
        buf.lock_data()[0] = 9;
        assert!(buf.set_dirty());
        assert_eq!(buf.start_write(), WriteStart::Started);

        // Hold the data lock so neither submission can complete early.
        let guard = buf.lock_data();
        engine.submit(IoDir::Write, 4, Arc::clone(&buf));
        engine.submit(IoDir::Write, 4, Arc::clone(&buf));
        drop(guard);

        buf.wait_bit_clear(B_WRITING);
        assert_eq!(dev.write_count(), 1);
        assert_eq!(dev.snapshot()[4 * EXTENT_SIZE], 9);
    }

    #[test]
    fn release_unlinks_clean_idle_buffer() {
        let (queue, dev) = test_queue(4);

        let handle = queue.read_extent(9).unwrap();
        handle.release();
        assert_eq!(queue.cached(), 0);

        // A fresh read goes back to the device.
        let handle = queue.read_extent(9).unwrap();
        assert_eq!(dev.read_count(), 2);
        handle.put();
    }

    #[test]
    fn put_keeps_buffer_cached() {
        let (queue, _dev) = test_queue(4);
        let handle = queue.read_extent(9).unwrap();
        handle.put();
        assert_eq!(queue.cached(), 1);
    }

    #[test]
    fn read_error_is_surfaced_once_and_not_cached() {
        let (queue, _dev) = test_queue(4);

        // Extent past the device end: the engine records a failed read.
        let err = queue.read_extent(1000).unwrap_err();
        assert!(matches!(err, FsError::Device { extent: 1000, .. }));
        assert_eq!(queue.cached(), 0);
        queue.check_invariants();
    }

    #[test]
    fn eviction_prefers_coldest_clean_buffer() {
        let (queue, dev) = test_queue(2);

        queue.read_extent(1).unwrap().put();
        queue.read_extent(2).unwrap().put();

        // Pool exhausted; this miss must evict extent 1 (coldest).
        let handle = queue.read_extent(3).unwrap();
        assert_eq!(queue.cached(), 2);
        {
            let state = queue.shared.state.lock();
            assert!(!state.index.contains_key(&1));
            assert!(state.index.contains_key(&2));
        }
        handle.put();
        assert_eq!(dev.read_count(), 3);
    }

    #[test]
    fn dirty_victim_is_flushed_before_reuse() {
        let (queue, dev) = test_queue(1);

        let handle = queue.new_extent(5).unwrap();
        handle.data()[0] = 0xEE;
        handle.mark_dirty();
        handle.put();

        // Only buffer is dirty; the next miss must write it back first.
        let handle = queue.read_extent(6).unwrap();
        handle.put();

        let image = dev.snapshot();
        assert_eq!(image[5 * EXTENT_SIZE], 0xEE);
    }

    #[test]
    fn handle_drop_behaves_like_put() {
        let (queue, _dev) = test_queue(4);
        {
            let _handle = queue.read_extent(2).unwrap();
        }
        // Hold released: the buffer is reclaimable.
        let state = queue.shared.state.lock();
        assert_eq!(state.index[&2].hold_cnt, 0);
    }
}
