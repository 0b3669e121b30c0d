//! The Nintendo Hashed filesystem (HFS0), a PFS0 variant whose entries
//! carry a SHA-256 over the head of each file. Game cards (XCI) nest these:
//! a root HFS0 whose entries are themselves HFS0 partitions.

use binrw::prelude::*;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::io::{SharedReader, SubFile};

/// Nintendo Switch HFS0 (Hashed File System 0) header structure
///
/// The first 0x200 bytes of the game-card file area act as a global header
/// and represent the root partition, which points at the other partitions
/// ("normal", "logo", "update" and "secure").
#[derive(Debug)]
#[binrw]
#[brw(little, magic = b"HFS0")]
pub struct Hfs0Header {
    pub file_count: u32,
    pub string_table_size: u32,
    pub _reserved: u32,
    #[br(count = file_count)]
    pub file_entries: Vec<Hfs0Entry>,
    /// String table - 00-padded to align the start of raw filedata with a
    /// sector/media unit boundary
    #[br(count = string_table_size)]
    pub string_table: Vec<u8>,
}

/// One 0x40-byte HFS0 entry.
#[derive(Debug)]
#[binrw]
#[brw(little)]
pub struct Hfs0Entry {
    /// Offset of the file in the data region
    pub offset: u64,
    /// File size
    pub size: u64,
    /// Offset of filename in string table
    pub filename_offset: u32,
    /// Size of the hashed region of the file (for sub-HFS0s this is the
    /// size of the pre-filedata portion, for NCAs usually 0x200)
    pub hashed_region_size: u32,
    /// Reserved field
    pub _reserved: u64,
    /// SHA-256 hash over the first `hashed_region_size` bytes of filedata
    pub sha256: [u8; 0x20],
}

/// A resolved file within an HFS0.
#[derive(Debug)]
pub struct Hfs0File {
    pub name: String,
    pub size: u64,
    /// Absolute offset of the file within this HFS0's reader.
    pub offset: u64,
    pub hash: [u8; 0x20],
}

/// HFS0 parser.
pub struct Hfs0<R: Read + Seek> {
    pub header: Hfs0Header,
    pub reader: R,
}

impl<R: Read + Seek> Hfs0<R> {
    /// Parse an HFS0 from a reader positioned at the partition start.
    pub fn new(mut reader: R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let header = Hfs0Header::read(&mut reader).map_err(|e| match e {
            binrw::Error::BadMagic { .. } => Error::InvalidMagic { location: "HFS0" },
            other => Error::BinaryParser(other),
        })?;
        Ok(Self { header, reader })
    }

    /// Size of the header region: fixed fields, 0x40 per entry, then the
    /// string table. File offsets are relative to its end.
    fn header_size(&self) -> u64 {
        0x10 + 0x40 * self.header.file_entries.len() as u64
            + self.header.string_table_size as u64
    }

    fn entry_name(&self, entry: &Hfs0Entry) -> Result<String> {
        let bytes = &self.header.string_table[entry.filename_offset as usize..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec()).map_err(|_| Error::InvalidFieldRange {
            field: "HFS0 file name",
            value: entry.filename_offset as u64,
        })
    }

    /// All files, in entry order.
    pub fn list_files(&self) -> Result<Vec<Hfs0File>> {
        self.header
            .file_entries
            .iter()
            .map(|entry| {
                Ok(Hfs0File {
                    name: self.entry_name(entry)?,
                    size: entry.size,
                    offset: entry.offset + self.header_size(),
                    hash: entry.sha256,
                })
            })
            .collect()
    }

    /// Look a file up by name.
    pub fn get_file(&self, name: &str) -> Result<Option<Hfs0File>> {
        for entry in &self.header.file_entries {
            if self.entry_name(entry)? == name {
                return Ok(Some(Hfs0File {
                    name: name.to_string(),
                    size: entry.size,
                    offset: entry.offset + self.header_size(),
                    hash: entry.sha256,
                }));
            }
        }
        Ok(None)
    }

    /// Read a file's data into a vector.
    pub fn read_to_vec(&mut self, file: &Hfs0File) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(file.offset))?;
        let mut data = vec![0; file.size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }
}

impl<R: Read + Seek + Clone> Hfs0<R> {
    /// Create a SubFile reader for a given file entry.
    pub fn subfile(&self, file: &Hfs0File) -> SubFile<R> {
        SubFile::new(self.reader.clone(), file.offset, file.offset + file.size)
    }
}

impl<R: Read + Seek> Hfs0<SharedReader<R>> {
    /// Parse from a shared reader.
    pub fn from_shared(reader: SharedReader<R>) -> Result<Self> {
        Self::new(reader)
    }
}

#[cfg(test)]
pub(crate) fn build_test_hfs0(files: &[(&str, &[u8])]) -> Vec<u8> {
    use crate::crypto::sha256;
    use byteorder::{LittleEndian, WriteBytesExt};

    let string_table: Vec<u8> = files
        .iter()
        .flat_map(|(name, _)| name.bytes().chain(std::iter::once(0)))
        .collect();

    let mut out = Vec::new();
    out.extend_from_slice(b"HFS0");
    out.write_u32::<LittleEndian>(files.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(string_table.len() as u32)
        .unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();

    let mut data_offset = 0u64;
    let mut name_offset = 0u32;
    for (name, data) in files {
        let hashed = (data.len() as u32).min(0x200);
        out.write_u64::<LittleEndian>(data_offset).unwrap();
        out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
        out.write_u32::<LittleEndian>(name_offset).unwrap();
        out.write_u32::<LittleEndian>(hashed).unwrap();
        out.write_u64::<LittleEndian>(0).unwrap();
        out.extend_from_slice(&sha256(&data[..hashed as usize]));
        data_offset += data.len() as u64;
        name_offset += name.len() as u32 + 1;
    }
    out.extend_from_slice(&string_table);
    for (_, data) in files {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use std::io::Cursor;

    #[test]
    fn test_parse_and_read() {
        let image = build_test_hfs0(&[("first.bin", &[1u8; 0x30]), ("second.bin", b"abc")]);
        let mut hfs0 = Hfs0::new(Cursor::new(image)).unwrap();

        assert_eq!(hfs0.header.file_count, 2);
        let files = hfs0.list_files().unwrap();
        assert_eq!(files[0].name, "first.bin");
        assert_eq!(files[1].name, "second.bin");
        assert_eq!(files[0].hash, sha256(&[1u8; 0x30]));

        let second = hfs0.get_file("second.bin").unwrap().unwrap();
        assert_eq!(hfs0.read_to_vec(&second).unwrap(), b"abc");
        assert!(hfs0.get_file("absent").unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let err = Hfs0::new(Cursor::new(vec![0u8; 0x40])).err().unwrap();
        assert!(matches!(err, Error::InvalidMagic { location: "HFS0" }));
    }
}
