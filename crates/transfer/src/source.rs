//! Source contract: random-access range reads over the file being sent.
//!
//! Reads are blocking; the send pipeline hops them onto the blocking
//! pool. The sender never buffers the whole file, only the sub-chunks
//! currently in flight.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

/// A readable transfer source.
pub trait Source: Send + Sync + 'static {
    /// File name announced in `file-start`.
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset` (blocking).
    fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// A file on disk.
pub struct FileSource {
    name: String,
    size: u64,
    file: Mutex<File>,
}

impl FileSource {
    /// Opens `path` for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            size,
            file: Mutex::new(file),
        })
    }
}

impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An in-memory source. Useful in tests and for already-buffered data.
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "range beyond end of source")
            })?;
        Ok(self.data[start..end].to_vec())
    }
}
