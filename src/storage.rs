//! Positioned file access.
//!
//! The tree owns exactly one file handle. All reads and writes go through
//! this wrapper, which seeks to an absolute offset first; nothing here
//! buffers, so a completed write is in the hands of the operating system.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

pub(crate) struct StorageFile {
    file: File,
}

impl StorageFile {
    pub fn new(file: File) -> Self {
        StorageFile { file }
    }

    pub fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Current end-of-file offset.
    pub fn end(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    pub fn read_record(&mut self, position: u64, len: usize) -> io::Result<Vec<u8>> {
        self.seek_to(position)?;
        let mut buf = vec![0; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_record(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        self.seek_to(position)?;
        self.file.write_all(data)
    }

    /// Append a record at end-of-file, returning the offset it begins at.
    pub fn append_record(&mut self, data: &[u8]) -> io::Result<u64> {
        let position = self.end()?;
        self.file.write_all(data)?;
        Ok(position)
    }
}

// Value records have no length known up front; the codec reads them as a
// stream from the current position.
impl Read for StorageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for StorageFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
