use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::Bytes;

/// Storage-level failures, translated by the buffer into public errors.
#[derive(Debug)]
pub enum StorageError {
    /// The tier cannot be written to (read-only memory view).
    NotWritable,
    Io(std::io::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Position handle into a [`BlobStorage`]. The chunk cursor is only valid
/// for the generation it was computed against; storage promotion bumps the
/// generation and the cursor is lazily re-derived from the absolute
/// position.
#[derive(Debug, Clone)]
pub struct BlobPointer {
    pos: u64,
    generation: u64,
    cursor: Cursor,
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Chunked memory tier: index of the current chunk and offset within it.
    Chunk { idx: usize, off: usize },
    /// Flat tiers address by absolute position alone.
    Flat,
}

impl BlobPointer {
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Copy another pointer's position into this one (mark/reset support).
    pub fn set(&mut self, other: &BlobPointer) {
        *self = other.clone();
    }
}

/// The storage tier behind a spill buffer.
///
/// Tiers only ever move forward: `ReadOnly` to `Memory` on the first write,
/// `Memory` to `TempFile` once the configured size limit is crossed.
pub enum BlobStorage {
    /// Zero-copy view over caller-provided bytes.
    ReadOnly { data: Bytes, generation: u64 },
    /// List of doubling chunks.
    Memory {
        chunks: Vec<Vec<u8>>,
        total: u64,
        generation: u64,
    },
    /// Anonymous temporary file, unlinked at creation.
    TempFile {
        file: File,
        total: u64,
        generation: u64,
    },
}

impl BlobStorage {
    pub fn empty_memory() -> Self {
        Self::Memory {
            chunks: Vec::new(),
            total: 0,
            generation: 0,
        }
    }

    pub fn memory_from(data: Vec<u8>) -> Self {
        let total = data.len() as u64;
        let chunks = if data.is_empty() { Vec::new() } else { vec![data] };

        Self::Memory {
            chunks,
            total,
            generation: 0,
        }
    }

    pub fn read_only(data: Bytes) -> Self {
        Self::ReadOnly {
            data,
            generation: 0,
        }
    }

    /// Create a tempfile tier pre-loaded with `content`, continuing the
    /// generation sequence of the storage it replaces.
    pub fn temp_file_from(content: &mut dyn Read, prev_generation: u64) -> StorageResult<Self> {
        let mut file = tempfile::tempfile()?;
        let total = std::io::copy(content, &mut file)?;

        Ok(Self::TempFile {
            file,
            total,
            generation: prev_generation + 1,
        })
    }

    pub fn generation(&self) -> u64 {
        match self {
            Self::ReadOnly { generation, .. }
            | Self::Memory { generation, .. }
            | Self::TempFile { generation, .. } => *generation,
        }
    }

    pub fn set_generation(&mut self, generation: u64) {
        match self {
            Self::ReadOnly { generation: g, .. }
            | Self::Memory { generation: g, .. }
            | Self::TempFile { generation: g, .. } => *g = generation,
        }
    }

    pub fn is_temp_file(&self) -> bool {
        matches!(self, Self::TempFile { .. })
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly { .. })
    }

    pub fn total_count(&self) -> u64 {
        match self {
            Self::ReadOnly { data, .. } => data.len() as u64,
            Self::Memory { total, .. } | Self::TempFile { total, .. } => *total,
        }
    }

    pub fn create_pointer(&self) -> BlobPointer {
        let cursor = match self {
            Self::Memory { .. } => Cursor::Chunk { idx: 0, off: 0 },
            _ => Cursor::Flat,
        };

        BlobPointer {
            pos: 0,
            generation: self.generation(),
            cursor,
        }
    }

    /// Re-derive the chunk cursor after a storage promotion.
    fn reseat(&self, ptr: &mut BlobPointer) {
        if ptr.generation == self.generation() {
            return;
        }

        let pos = ptr.pos;
        *ptr = self.create_pointer();
        self.advance(ptr, pos);
    }

    /// Move the pointer forward `step` bytes. The caller keeps the pointer
    /// within `[0, total]`.
    pub fn advance(&self, ptr: &mut BlobPointer, step: u64) {
        self.reseat(ptr);

        if let (Self::Memory { chunks, .. }, Cursor::Chunk { .. }) = (self, &ptr.cursor) {
            Self::advance_chunk_cursor(chunks, &mut ptr.cursor, step);
        }

        ptr.pos += step;
    }

    /// Read a single byte, advancing the pointer. `None` at end of data.
    pub fn read_byte(&mut self, ptr: &mut BlobPointer) -> StorageResult<Option<u8>> {
        let mut one = [0u8; 1];

        Ok(match self.read(ptr, &mut one)? {
            0 => None,
            _ => Some(one[0]),
        })
    }

    /// Read up to `dst.len()` bytes at the pointer, advancing it. Returns
    /// the number of bytes read; zero means end of data.
    pub fn read(&mut self, ptr: &mut BlobPointer, dst: &mut [u8]) -> StorageResult<usize> {
        self.reseat(ptr);

        let total = self.total_count();

        if ptr.pos >= total || dst.is_empty() {
            return Ok(0);
        }

        let to_read = dst.len().min((total - ptr.pos) as usize);

        match self {
            Self::ReadOnly { data, .. } => {
                let start = ptr.pos as usize;
                dst[..to_read].copy_from_slice(&data[start..start + to_read]);
                ptr.pos += to_read as u64;
                Ok(to_read)
            }
            Self::Memory { chunks, .. } => {
                let mut copied = 0;

                while copied < to_read {
                    let (idx, off) = match ptr.cursor {
                        Cursor::Chunk { idx, off } => (idx, off),
                        Cursor::Flat => unreachable!("memory tier uses chunk cursors"),
                    };

                    let chunk = &chunks[idx];
                    let n = (to_read - copied).min(chunk.len() - off);

                    dst[copied..copied + n].copy_from_slice(&chunk[off..off + n]);
                    copied += n;

                    // Advance below re-reads the cursor, so chunks is not
                    // borrowed across the call.
                    let step = n as u64;
                    Self::advance_chunk_cursor(chunks, &mut ptr.cursor, step);
                    ptr.pos += step;
                }

                Ok(copied)
            }
            Self::TempFile { file, .. } => {
                file.seek(SeekFrom::Start(ptr.pos))?;
                file.read_exact(&mut dst[..to_read])?;
                ptr.pos += to_read as u64;
                Ok(to_read)
            }
        }
    }

    /// Write `src` at the pointer, advancing it and growing the total as
    /// needed. The read-only tier reports [`StorageError::NotWritable`].
    pub fn write(&mut self, ptr: &mut BlobPointer, src: &[u8]) -> StorageResult<()> {
        self.reseat(ptr);

        match self {
            Self::ReadOnly { .. } => Err(StorageError::NotWritable),
            Self::Memory { chunks, total, .. } => {
                let mut remaining = src.len();

                while remaining > 0 {
                    let (idx, off) = match ptr.cursor {
                        Cursor::Chunk { idx, off } => (idx, off),
                        Cursor::Flat => unreachable!("memory tier uses chunk cursors"),
                    };

                    if idx == chunks.len() {
                        // Out of allocated chunks; grow by doubling.
                        let new_size = match chunks.last() {
                            None => remaining,
                            Some(last) => (last.len() * 2).max(remaining),
                        };

                        chunks.push(vec![0u8; new_size]);
                    }

                    let chunk = &mut chunks[idx];
                    let n = remaining.min(chunk.len() - off);
                    let written = src.len() - remaining;

                    chunk[off..off + n].copy_from_slice(&src[written..written + n]);
                    remaining -= n;

                    let step = n as u64;
                    Self::advance_chunk_cursor(chunks, &mut ptr.cursor, step);
                    ptr.pos += step;
                }

                *total = (*total).max(ptr.pos);
                Ok(())
            }
            Self::TempFile { file, total, .. } => {
                file.seek(SeekFrom::Start(ptr.pos))?;
                file.write_all(src)?;
                ptr.pos += src.len() as u64;
                *total = (*total).max(ptr.pos);
                Ok(())
            }
        }
    }

    /// Shorten the storage to `len` bytes. Read-only views cannot shrink in
    /// place and report [`StorageError::NotWritable`].
    pub fn truncate(&mut self, len: u64) -> StorageResult<()> {
        match self {
            Self::ReadOnly { .. } => Err(StorageError::NotWritable),
            Self::Memory {
                chunks,
                total,
                generation,
            } => {
                // Drop whole chunks past the cut; partial chunks keep their
                // allocation, only the logical total shrinks.
                let mut kept = 0u64;
                let mut keep_chunks = 0;

                for chunk in chunks.iter() {
                    if kept >= len {
                        break;
                    }

                    kept += chunk.len() as u64;
                    keep_chunks += 1;
                }

                chunks.truncate(keep_chunks);
                *total = len;

                // Chunk cursors of live streams may point past the cut;
                // a generation bump makes them re-derive lazily.
                *generation += 1;

                Ok(())
            }
            Self::TempFile { file, total, .. } => {
                file.set_len(len)?;
                *total = len;
                Ok(())
            }
        }
    }

    fn advance_chunk_cursor(chunks: &[Vec<u8>], cursor: &mut Cursor, step: u64) {
        if let Cursor::Chunk { idx, off } = cursor {
            let mut remain = step;

            while remain > 0 && *idx < chunks.len() {
                let chunk_left = (chunks[*idx].len() - *off) as u64;

                if remain >= chunk_left {
                    remain -= chunk_left;
                    *off = 0;
                    *idx += 1;
                } else {
                    *off += remain as usize;
                    remain = 0;
                }
            }
        }
    }
}

impl std::fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly { data, .. } => {
                write!(f, "BlobStorage::ReadOnly(len={})", data.len())
            }
            Self::Memory { chunks, total, .. } => {
                write!(f, "BlobStorage::Memory(chunks={}, total={total})", chunks.len())
            }
            Self::TempFile { total, .. } => write!(f, "BlobStorage::TempFile(total={total})"),
        }
    }
}
