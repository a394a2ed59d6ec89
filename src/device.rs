//! # Device Layer
//!
//! Positioned byte I/O against the backing store. The cache and allocator
//! never touch a file descriptor directly; they go through [`ExtentDevice`],
//! which the I/O engine drives at byte offset `extent_no * extent_size`.
//!
//! Two implementations are provided:
//!
//! - [`FileDevice`]: a regular file or block device, using
//!   `std::os::unix::fs::FileExt` pread/pwrite so no shared seek position is
//!   needed across the worker threads.
//! - [`MemDevice`]: an in-memory image for tests and tooling.
//!
//! Both enforce bounds: a read or write that would cross the end of the
//! device fails instead of silently truncating.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Byte-addressed backing store with pread/pwrite semantics.
///
/// Implementations must be safe to call from multiple worker threads at
/// once; offsets are explicit so there is no shared cursor.
pub trait ExtentDevice: Send + Sync {
    /// Total device length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> io::Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> io::Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "I/O range overflows u64"))?;
    if end > device_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("I/O out of bounds: offset={offset} len={len} device_len={device_len}"),
        ));
    }
    Ok(())
}

/// File-backed device.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ExtentDevice for FileDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// In-memory device for tests.
///
/// Tracks physical read counts so tests can assert the at-most-one-read
/// guarantee of the cache miss path.
#[derive(Debug)]
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    reads: std::sync::atomic::AtomicU64,
    writes: std::sync::atomic::AtomicU64,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0u8; len]),
            reads: std::sync::atomic::AtomicU64::new(0),
            writes: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Build a device over an existing image.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes),
            reads: std::sync::atomic::AtomicU64::new(0),
            writes: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Number of physical reads performed so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Number of physical writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Copy out a snapshot of the raw image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ExtentDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        self.reads
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        self.writes
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
