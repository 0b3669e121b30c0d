//! # Nintendo PFS0 (PartitionFS0) format
//!
//! The Partition File System (PFS0) is the flat archive format the Switch
//! uses for packaging files. NSP (Nintendo Submission Package) files are
//! simply PFS0 images packed for distribution.
//!
//! This module provides both directions: [`Pfs0`] parses an existing image
//! from any `Read + Seek` source, and [`Pfs0Builder`] emits a new one from
//! named byte blobs. The SHA-256 block hash table that NCA sections lay over
//! a PFS0 body lives here too ([`Pfs0HashTable`]).

use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::io::align_up;

/// Type alias for NSP (Nintendo Submission Package), which are simply just
/// PFS0 images.
pub type Nsp<R> = Pfs0<R>;

/// Nintendo Switch PFS0 (PartitionFS0) header structure
///
/// # Format Layout
/// - 0x00: Magic "PFS0" (4 bytes, validated by binrw)
/// - 0x04: Number of files (4 bytes)
/// - 0x08: String table size (4 bytes)
/// - 0x0C: Reserved (4 bytes, zero)
#[derive(BinRead, Debug)]
#[brw(little, magic = b"PFS0")]
pub struct Pfs0Header {
    /// Number of files contained in this PFS0 archive
    pub num_files: u32,
    /// Size of the string table in bytes
    pub str_table_size: u32,
    /// Reserved field, typically set to zeros
    pub reserved: [u8; 4],
}

/// A single file entry within the archive.
///
/// `data_offset` is relative to the start of the data region, which begins
/// after the header, all file entries, and the string table.
#[derive(BinRead, Debug)]
#[brw(little)]
pub struct Pfs0Entry {
    /// Offset to file data, relative to the start of the data region
    pub data_offset: u64,
    /// Size of the file data in bytes
    pub data_size: u64,
    /// Offset into the string table for the null-terminated filename
    pub string_table_offset: u32,
    /// Reserved field, usually zeroes
    pub reserved: [u8; 4],
}

impl Pfs0Entry {
    /// Extract the filename from the string table.
    pub fn get_name(&self, string_table: &[u8]) -> Result<String> {
        let name_start = self.string_table_offset as usize;
        if name_start >= string_table.len() {
            return Err(Error::InvalidFieldRange {
                field: "PFS0 string table offset",
                value: name_start as u64,
            });
        }
        let name_end = string_table[name_start..]
            .iter()
            .position(|&x| x == 0)
            .map(|p| name_start + p)
            .unwrap_or(string_table.len());

        String::from_utf8(string_table[name_start..name_end].to_vec()).map_err(|_| {
            Error::InvalidFieldRange {
                field: "PFS0 file name",
                value: name_start as u64,
            }
        })
    }
}

/// A file within the PFS0 archive with both metadata and name.
#[derive(Debug)]
pub struct Pfs0File {
    /// Filename extracted from the string table
    pub name: String,
    /// File entry metadata including size and offset information
    pub entry: Pfs0Entry,
}

/// Parser for PFS0 archives.
pub struct Pfs0<R: Read + Seek> {
    /// The underlying reader for the PFS0 archive
    pub reader: R,
    /// Parsed header information
    pub header: Pfs0Header,
    /// List of files contained in the archive with their metadata
    pub files: Vec<Pfs0File>,
}

impl<R: Read + Seek> Pfs0<R> {
    /// Parse a PFS0 from a reader positioned at the image start.
    pub fn new(mut reader: R) -> Result<Self> {
        let header: Pfs0Header = reader.read_le().map_err(|e| match e {
            binrw::Error::BadMagic { .. } => Error::InvalidMagic { location: "PFS0" },
            other => Error::BinaryParser(other),
        })?;

        let entries = (0..header.num_files)
            .map(|_| reader.read_le::<Pfs0Entry>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut string_table = vec![0u8; header.str_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries.into_iter() {
            let name = entry.get_name(&string_table)?;
            files.push(Pfs0File { name, entry });
        }

        tracing::trace!(files = files.len(), "PFS0 parsed");

        Ok(Self {
            reader,
            header,
            files,
        })
    }

    /// Byte offset of the data region within the image.
    fn data_region_offset(&self) -> u64 {
        0x10 + (0x18 * self.header.num_files as u64) + (self.header.str_table_size as u64)
    }

    /// Read a whole file out of the archive by name.
    pub fn read_file(&mut self, vpath: &str) -> Result<Vec<u8>> {
        let file = self
            .files
            .iter()
            .find(|f| f.name == vpath)
            .ok_or_else(|| Error::MissingInput {
                name: vpath.to_string(),
            })?;
        let offset = self.data_region_offset() + file.entry.data_offset;
        let size = file.entry.data_size as usize;

        tracing::trace!(?vpath, offset = format!("{offset:012X}"), size, "reading entry");

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Names of all files in the archive, in entry order.
    pub fn list_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Builds a PFS0 image from named byte blobs.
///
/// Entry order is insertion order: string-table offsets are monotonic and
/// the data region is concatenated in the same order with no per-file
/// padding. The string table itself is zero-padded up to a 0x20 boundary.
#[derive(Default)]
pub struct Pfs0Builder {
    files: Vec<(String, Vec<u8>)>,
}

impl Pfs0Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a file. Order is preserved in the output.
    pub fn add_file(&mut self, name: impl Into<String>, data: Vec<u8>) -> &mut Self {
        self.files.push((name.into(), data));
        self
    }

    /// Serialize the archive.
    pub fn build(&self) -> Result<Vec<u8>> {
        let string_table_size: u64 = self
            .files
            .iter()
            .map(|(name, _)| name.len() as u64 + 1)
            .sum();
        let string_table_size = align_up(string_table_size, 0x20);

        let header_size = 0x10 + 0x18 * self.files.len() as u64 + string_table_size;
        let data_size: u64 = self.files.iter().map(|(_, d)| d.len() as u64).sum();

        let mut out = Vec::with_capacity((header_size + data_size) as usize);
        out.extend_from_slice(b"PFS0");
        out.write_u32::<LittleEndian>(self.files.len() as u32)?;
        out.write_u32::<LittleEndian>(string_table_size as u32)?;
        out.write_u32::<LittleEndian>(0)?;

        let mut data_offset = 0u64;
        let mut name_offset = 0u32;
        for (name, data) in &self.files {
            out.write_u64::<LittleEndian>(data_offset)?;
            out.write_u64::<LittleEndian>(data.len() as u64)?;
            out.write_u32::<LittleEndian>(name_offset)?;
            out.write_u32::<LittleEndian>(0)?;
            data_offset += data.len() as u64;
            name_offset += name.len() as u32 + 1;
        }

        for (name, _) in &self.files {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out.resize(header_size as usize, 0);

        for (_, data) in &self.files {
            out.extend_from_slice(data);
        }

        tracing::debug!(
            files = self.files.len(),
            size = out.len(),
            "PFS0 image built"
        );
        Ok(out)
    }
}

/// SHA-256 hash table over fixed-size blocks of a PFS0 image, as stored in
/// HierarchicalSha256 NCA sections.
pub struct Pfs0HashTable {
    /// Hash data padded out to a 0x200 multiple; this padded length is the
    /// `pfs0_offset` field of the superblock.
    pub table: Vec<u8>,
    /// Unpadded hash data length (`block_count * 0x20`).
    pub hash_data_size: u64,
    /// Block size the table was computed with.
    pub block_size: u32,
}

impl Pfs0HashTable {
    /// Hash `data` in blocks of `block_size`; the last block is zero-padded
    /// to the full block size before hashing.
    pub fn create(data: &[u8], block_size: u32) -> Self {
        let block_size_usize = block_size as usize;
        let block_count = data.len().div_ceil(block_size_usize);

        let mut table = Vec::with_capacity(block_count * 0x20);
        let mut padded = vec![0u8; block_size_usize];
        for block in data.chunks(block_size_usize) {
            if block.len() == block_size_usize {
                table.extend_from_slice(&sha256(block));
            } else {
                padded[..block.len()].copy_from_slice(block);
                padded[block.len()..].fill(0);
                table.extend_from_slice(&sha256(&padded));
            }
        }

        let hash_data_size = table.len() as u64;
        table.resize(align_up(hash_data_size, 0x200) as usize, 0);

        Self {
            table,
            hash_data_size,
            block_size,
        }
    }

    /// SHA-256 over the unpadded hash data.
    pub fn master_hash(&self) -> [u8; 0x20] {
        sha256(&self.table[..self.hash_data_size as usize])
    }

    /// Padded table length; doubles as the `pfs0_offset` superblock field.
    pub fn pfs0_offset(&self) -> u64 {
        self.table.len() as u64
    }
}
