//! Random-access sources a table can be read from.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Positional reads over an immutable byte source.
pub trait Readable: Send + Sync {
    /// Fills `buf` from `offset`. A short read is an `UnexpectedEof` error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Total size in bytes.
    fn size(&self) -> u64;
}

/// A table file on disk.
///
/// Reads seek then read under a lock, so concurrent iterators over one file are
/// serialized at the I/O call.
#[derive(Debug)]
pub struct FileReadable {
    file: Mutex<File>,
    size: u64,
}

impl FileReadable {
    /// Opens the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }

    /// Wraps an open file.
    pub fn new(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), size })
    }
}

impl Readable for FileReadable {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A table held in memory.
#[derive(Debug, Clone)]
pub struct MemReadable {
    data: Bytes,
}

impl MemReadable {
    /// Creates a readable over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl Readable for MemReadable {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.checked_add(buf.len()).filter(|&e| e <= self.data.len()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past end {}", buf.len(), offset, self.data.len()),
            )
        })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
