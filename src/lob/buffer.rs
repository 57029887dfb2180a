use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{GridError, Result};
use crate::lob::storage::{BlobPointer, BlobStorage, StorageError};

/// Seekable binary buffer that stores data in memory and transparently
/// spills to a temporary file once the size crosses `max_memory_bytes`.
///
/// Once spilled the buffer never returns to memory, even after truncation.
/// A buffer wrapping caller-provided bytes starts in a zero-copy read-only
/// tier; the first write copies the data once into the writable memory
/// tier.
///
/// Readers and writers stay valid across tier promotions: changes done
/// through any live writer are visible through readers created earlier.
/// The buffer is not intended for lock-contended use, but streams may be
/// held concurrently; a single mutex serializes storage access.
pub struct SpillBuffer {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    storage: BlobStorage,
    max_memory_bytes: u64,
    closed: bool,
}

impl SpillBuffer {
    /// Create an empty read-write buffer.
    pub fn new(max_memory_bytes: u64) -> Self {
        Self::with_storage(BlobStorage::empty_memory(), max_memory_bytes)
    }

    /// Wrap existing bytes without copying; the buffer starts read-only.
    pub fn wrap_read_only(max_memory_bytes: u64, data: Bytes) -> Self {
        Self::with_storage(BlobStorage::read_only(data), max_memory_bytes)
    }

    /// Wrap an owned byte vector in the writable memory tier.
    pub fn wrap(max_memory_bytes: u64, data: Vec<u8>) -> Self {
        Self::with_storage(BlobStorage::memory_from(data), max_memory_bytes)
    }

    fn with_storage(storage: BlobStorage, max_memory_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                storage,
                max_memory_bytes,
                closed: false,
            })),
        }
    }

    /// A handle sharing this buffer's storage.
    pub fn shared(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    pub fn total_count(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.storage.total_count())
    }

    /// Whether the buffer has spilled to a temporary file.
    pub fn is_spilled(&self) -> Result<bool> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.storage.is_temp_file())
    }

    /// Reader over the entire content, unbounded: it also returns data
    /// appended after its creation.
    pub fn open_read(&self) -> Result<BlobReader> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let ptr = inner.storage.create_pointer();

        Ok(BlobReader {
            inner: self.inner.clone(),
            marked: ptr.clone(),
            ptr,
            start: 0,
            limit: None,
        })
    }

    /// Bounded reader over `len` bytes starting at zero-based `pos`.
    pub fn open_read_range(&self, pos: u64, len: u64) -> Result<BlobReader> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let total = inner.storage.total_count();

        if pos >= total || len > total - pos {
            return Err(GridError::OutOfRange(format!(
                "invalid read range [pos={pos}, len={len}, total={total}]"
            )));
        }

        let mut ptr = inner.storage.create_pointer();
        inner.storage.advance(&mut ptr, pos);

        Ok(BlobReader {
            inner: self.inner.clone(),
            marked: ptr.clone(),
            ptr,
            start: pos,
            limit: Some(len),
        })
    }

    /// Writer starting at zero-based `pos`, which must not exceed the
    /// current total.
    pub fn open_write(&self, pos: u64) -> Result<BlobWriter> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let total = inner.storage.total_count();

        if pos > total {
            return Err(GridError::OutOfRange(format!(
                "write position past end of buffer [pos={pos}, total={total}]"
            )));
        }

        let mut ptr = inner.storage.create_pointer();
        inner.storage.advance(&mut ptr, pos);

        Ok(BlobWriter {
            inner: self.inner.clone(),
            ptr,
        })
    }

    /// Shorten the buffer to `len` bytes. Never demotes a spilled buffer
    /// back to memory.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let total = inner.storage.total_count();

        if len > total {
            return Err(GridError::OutOfRange(format!(
                "truncation length exceeds buffer size [len={len}, total={total}]"
            )));
        }

        match inner.storage.truncate(len) {
            Ok(()) => Ok(()),
            Err(StorageError::NotWritable) => {
                inner.promote_to_memory()?;
                inner.storage.truncate(len).map_err(Inner::map_err)
            }
            Err(e) => Err(Inner::map_err(e)),
        }
    }

    /// Find `pattern` scanning from one-based `start`. Returns the
    /// one-based index of the first full match, or -1 when the pattern is
    /// empty, longer than the content, starts past the end, or simply does
    /// not occur.
    pub fn position(&self, pattern: &[u8], start: u64) -> Result<i64> {
        if start < 1 {
            return Err(GridError::OutOfRange(format!(
                "search start must be positive [start={start}]"
            )));
        }

        let total = self.total_count()?;

        if pattern.is_empty() || pattern.len() as u64 > total || start > total {
            return Ok(-1);
        }

        let from = start - 1;

        let mut reader = self.open_read()?;
        reader.skip(from)?;

        // Single linear scan. On the first matching byte the reader is
        // marked; a later mismatch resets it so scanning resumes from the
        // byte right after the start of the failed match.
        let mut matched: u64 = 0;
        let mut pos = from;
        let mut pattern_started = false;

        while let Some(b) = reader.read_byte()? {
            if b == pattern[matched as usize] {
                if !pattern_started {
                    pattern_started = true;
                    reader.mark();
                }

                pos += 1;
                matched += 1;

                if matched == pattern.len() as u64 {
                    return Ok((pos - matched + 1) as i64);
                }
            } else {
                pos = pos - matched + 1;
                matched = 0;

                if pattern_started {
                    pattern_started = false;
                    reader.reset();
                }
            }
        }

        Ok(-1)
    }

    /// Copy of the whole buffer content.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = self.total_count()? as usize;
        let mut out = vec![0u8; total];

        let mut reader = self.open_read()?;
        let n = reader.read_bytes(&mut out)?;
        out.truncate(n);

        Ok(out)
    }

    /// Free resources. Any temporary file is dropped here; the file was
    /// unlinked at creation, so it also disappears on process exit.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.storage = BlobStorage::empty_memory();
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(GridError::Closed);
        }

        Ok(())
    }

    fn map_err(e: StorageError) -> GridError {
        match e {
            StorageError::Io(io) => GridError::IoFailed(io),
            StorageError::NotWritable => {
                GridError::Internal("write to read-only storage".to_string())
            }
        }
    }

    /// Spill to a temporary file, draining the current tier through a
    /// pointer so live streams keep their positions.
    fn promote_to_file(&mut self) -> Result<()> {
        if self.storage.is_temp_file() {
            return Ok(());
        }

        let generation = self.storage.generation();
        let ptr = self.storage.create_pointer();

        let mut drain = StorageDrain {
            storage: &mut self.storage,
            ptr,
        };

        let new_storage =
            BlobStorage::temp_file_from(&mut drain, generation).map_err(Self::map_err)?;

        tracing::debug!(
            total = new_storage.total_count(),
            "LOB buffer spilled to temporary file"
        );

        self.storage = new_storage;
        Ok(())
    }

    /// Copy the borrowed read-only bytes once into the writable memory tier.
    fn promote_to_memory(&mut self) -> Result<()> {
        if !self.storage.is_read_only() {
            return Ok(());
        }

        let total = self.storage.total_count() as usize;
        let mut data = vec![0u8; total];
        let mut ptr = self.storage.create_pointer();
        self.storage.read(&mut ptr, &mut data).map_err(Self::map_err)?;

        let generation = self.storage.generation();
        let mut new_storage = BlobStorage::memory_from(data);
        new_storage.set_generation(generation + 1);

        self.storage = new_storage;
        Ok(())
    }

    /// Promote ahead of a write that would grow the buffer past the
    /// in-memory limit.
    fn promote_if_needed(&mut self, write_end: u64) -> Result<()> {
        if write_end.max(self.storage.total_count()) > self.max_memory_bytes
            && !self.storage.is_temp_file()
        {
            self.promote_to_file()?;
        }

        Ok(())
    }
}

/// Adapts a storage drain to `std::io::Read` for the tempfile copy.
struct StorageDrain<'a> {
    storage: &'a mut BlobStorage,
    ptr: BlobPointer,
}

impl io::Read for StorageDrain<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.storage.read(&mut self.ptr, buf).map_err(|e| match e {
            StorageError::Io(io) => io,
            StorageError::NotWritable => io::Error::other("read-only storage"),
        })
    }
}

/// Reader over a [`SpillBuffer`]. Supports mark/reset with no read limit,
/// as required by the pattern search.
pub struct BlobReader {
    inner: Arc<Mutex<Inner>>,
    ptr: BlobPointer,
    marked: BlobPointer,
    start: u64,
    limit: Option<u64>,
}

impl BlobReader {
    /// Read a single byte; `None` at end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut one = [0u8; 1];

        Ok(match self.read_bytes(&mut one)? {
            0 => None,
            _ => Some(one[0]),
        })
    }

    /// Read up to `dst.len()` bytes. Returns the number read; zero means
    /// end of stream.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let to_read = match self.limit {
            None => dst.len(),
            Some(limit) => {
                let end = self.start + limit;

                if self.ptr.pos() >= end {
                    return Ok(0);
                }

                dst.len().min((end - self.ptr.pos()) as usize)
            }
        };

        inner
            .storage
            .read(&mut self.ptr, &mut dst[..to_read])
            .map_err(Inner::map_err)
    }

    /// Remember the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.marked.set(&self.ptr);
    }

    /// Return to the last marked position (stream start if never marked).
    pub fn reset(&mut self) {
        self.ptr.set(&self.marked);
    }

    /// Skip forward up to `n` bytes; returns how many were skipped.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let total = inner.storage.total_count();
        let to_skip = n.min(total.saturating_sub(self.ptr.pos()));

        if to_skip > 0 {
            inner.storage.advance(&mut self.ptr, to_skip);
        }

        Ok(to_skip)
    }
}

impl io::Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(io::Error::other)
    }
}

/// Writer into a [`SpillBuffer`]. Each write first checks whether the
/// buffer must spill, then retries once through the writable memory tier
/// if the storage was read-only.
pub struct BlobWriter {
    inner: Arc<Mutex<Inner>>,
    ptr: BlobPointer,
}

impl BlobWriter {
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        inner.promote_if_needed(self.ptr.pos() + src.len() as u64)?;

        match inner.storage.write(&mut self.ptr, src) {
            Ok(()) => Ok(()),
            Err(StorageError::NotWritable) => {
                inner.promote_to_memory()?;
                inner
                    .storage
                    .write(&mut self.ptr, src)
                    .map_err(Inner::map_err)
            }
            Err(e) => Err(Inner::map_err(e)),
        }
    }
}

impl io::Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
