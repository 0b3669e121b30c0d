//! Shared I/O plumbing: alignment helpers, the Nintendo XTS tweak, and the
//! reader adapters used by the container parsers.

use std::io::{Read, Result, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// Align `value` down to a power-of-two boundary.
pub const fn align_down(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    value & !inv_mask
}

/// Align `value` up to a power-of-two boundary.
pub const fn align_up(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    (value + inv_mask) & !inv_mask
}

/// Returns a tweak suitable for Nintendo XTS crypto operations.
///
/// The tweak is the sector index in big-endian (byte 15 holds the low byte),
/// the reverse of the IEEE 1619 little-endian encoding.
pub fn get_nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// A shared reader that can be used by multiple consumers.
pub struct SharedReader<R: Read + Seek> {
    inner: Arc<Mutex<R>>,
}

impl<R: Read + Seek> Clone for SharedReader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Read + Seek> SharedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reader)),
        }
    }

    /// Create a SubFile window over this shared reader.
    pub fn sub_file(&self, start: u64, end: u64) -> SubFile<Self> {
        SubFile::new(self.clone(), start, end)
    }
}

impl<R: Read + Seek> Read for SharedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }
}

impl<R: Read + Seek> Seek for SharedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.inner.lock().unwrap().seek(pos)
    }
}

/// Represents a sub-section of a file.
pub struct SubFile<R: Read + Seek> {
    reader: R,
    start: u64,
    end: u64,
    position: u64,
}

impl<R: Read + Seek> SubFile<R> {
    pub fn new(reader: R, start: u64, end: u64) -> Self {
        Self {
            reader,
            start,
            end,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

impl<R: Read + Seek> Read for SubFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.start == self.end || self.position >= self.end - self.start {
            return Ok(0);
        }

        self.reader
            .seek(SeekFrom::Start(self.start + self.position))?;

        let max_read =
            std::cmp::min(buf.len() as u64, (self.end - self.start) - self.position) as usize;
        let bytes_read: usize = self.reader.read(&mut buf[..max_read])?;

        self.position += bytes_read as u64;
        Ok(bytes_read)
    }
}

impl<R: Read + Seek> Seek for SubFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(offset) => ((self.end - self.start) as i64 + offset) as u64,
            SeekFrom::Current(offset) => (self.position as i64 + offset) as u64,
        };

        if new_pos > self.end - self.start {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Cannot seek past end of subfile",
            ));
        }

        self.position = new_pos;
        Ok(self.position)
    }
}
