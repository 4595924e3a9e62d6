//! Sink contract: offset writes for the assembled file.
//!
//! The receive pipeline streams the verified prefix in flat-index
//! order, so writes arrive with strictly increasing offsets. Writes are
//! blocking; the pipeline hops them onto the blocking pool.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// A writable transfer sink.
pub trait Sink: Send + 'static {
    /// Prepares the sink for a file of `size` bytes.
    fn open(&mut self, name: &str, size: u64) -> io::Result<()>;

    /// Writes `data` at the given byte offset (blocking).
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Finalizes the output.
    fn close(&mut self) -> io::Result<()>;
}

/// Writes the assembled file under a base directory, named by the
/// `file-start` announcement.
pub struct FileSink {
    base: PathBuf,
    file: Option<File>,
    path: Option<PathBuf>,
}

impl FileSink {
    /// Creates a sink rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            file: None,
            path: None,
        }
    }

    /// Full path of the file being written, once opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Rejects names that would escape the sink's base directory.
fn validate_name(name: &str) -> io::Result<()> {
    let path = Path::new(name);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if name.is_empty() || escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file name: {name:?}"),
        ));
    }
    Ok(())
}

impl Sink for FileSink {
    fn open(&mut self, name: &str, _size: u64) -> io::Result<()> {
        validate_name(name)?;
        let full = self.base.join(name);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)?;
        self.file = Some(file);
        self.path = Some(full);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sink not opened"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Buffers the assembled file in memory.
pub struct MemorySink {
    data: Vec<u8>,
    opened: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            opened: false,
        }
    }

    /// The assembled bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for MemorySink {
    fn open(&mut self, _name: &str, size: u64) -> io::Result<()> {
        self.data = Vec::with_capacity(size as usize);
        self.opened = true;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.opened {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "sink not opened"));
        }
        let offset = offset as usize;
        if self.data.len() < offset + data.len() {
            self.data.resize(offset + data.len(), 0);
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path());
        sink.open("out.bin", 11).unwrap();
        sink.write(0, b"hello ").unwrap();
        sink.write(6, b"world").unwrap();
        sink.close().unwrap();

        assert_eq!(sink.path().unwrap(), dir.path().join("out.bin"));
        let content = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&content, b"hello world");
    }

    #[test]
    fn file_sink_write_before_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path());
        assert!(sink.write(0, b"x").is_err());
    }

    #[test]
    fn file_sink_rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path());
        assert!(sink.open("../evil.bin", 0).is_err());
        assert!(sink.open("/tmp/evil.bin", 0).is_err());
        assert!(sink.open("", 0).is_err());
    }

    #[test]
    fn file_sink_creates_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path());
        sink.open("sub/dir/file.bin", 4).unwrap();
        sink.write(0, b"data").unwrap();
        sink.close().unwrap();
        let content = std::fs::read(dir.path().join("sub/dir/file.bin")).unwrap();
        assert_eq!(&content, b"data");
    }

    #[test]
    fn memory_sink_assembles() {
        let mut sink = MemorySink::new();
        sink.open("x", 10).unwrap();
        sink.write(5, b"56789").unwrap();
        sink.write(0, b"01234").unwrap();
        sink.close().unwrap();
        assert_eq!(sink.as_bytes(), b"0123456789");
    }

    #[test]
    fn memory_sink_write_before_open_errors() {
        let mut sink = MemorySink::new();
        assert!(sink.write(0, b"x").is_err());
    }
}
