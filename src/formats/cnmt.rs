//! Content Meta (CNMT) records: the table describing which NCAs make up a
//! title, their SHA-256 hashes and 48-bit sizes.
//!
//! [`Cnmt::build_application`] emits the packaged application layout that
//! goes inside a Meta NCA; [`Cnmt::from_reader`] parses one back.
//!
//! # Layout
//! ```text
//! 0x00  header (0x20)            title id, version, meta type, counts
//! 0x20  extended header (0x10)   patch title id = title id + 0x800
//! 0x30  content records (0x38·N) hash | nca id | size(48) | type | id off
//! tail  digest (0x20)            zero
//! ```

use std::io::{Cursor, Read, Seek, SeekFrom};

use binrw::prelude::*;

use crate::error::Result;

/// Content Meta header structure.
#[derive(Debug, Clone)]
#[binrw]
#[brw(little)]
pub struct CnmtHeader {
    /// Title ID
    pub title_id: u64,
    /// Title version
    pub title_version: u32,
    /// Content meta type
    pub meta_type: ContentMetaType,
    /// Platform for the content meta (always NX)
    pub meta_platform: ContentMetaPlatform,
    /// Extended header size
    pub extended_header_size: u16,
    /// Number of content entries
    pub total_content_entries: u16,
    /// Number of meta entries
    pub total_content_meta_entries: u16,
    /// Content meta attributes
    pub attributes: u8,
    /// Storage ID
    pub storage_id: u8,
    /// Content install type
    pub content_install_type: u8,
    /// Reserved field
    pub _reserved: u8,
    /// Required system version for download
    pub required_dl_system_version: u32,
    pub _reserved2: u32,
}

/// Content Meta Type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentMetaType {
    Invalid = 0x00,
    SystemProgram = 0x01,
    SystemData = 0x02,
    SystemUpdate = 0x03,
    BootImagePackage = 0x04,
    BootImagePackageSafe = 0x05,
    /// An application
    Application = 0x80,
    /// A patch
    Patch = 0x81,
    /// An add-on
    AddOnContent = 0x82,
    /// A delta fragment
    Delta = 0x83,
    /// [15.0.0+] A data patch
    DataPatch = 0x84,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentMetaPlatform {
    /// NX (Nintendo Switch)
    NX = 0x00,
}

/// Extended header for the Application meta type.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default)]
pub struct ApplicationMetaExtendedHeader {
    /// Patch title ID (application title ID + 0x800)
    pub patch_id: u64,
    /// Minimum system version required
    pub required_system_version: u32,
    /// Required application version
    pub required_application_version: u32,
}

/// Content info: the record fields following the hash.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct PackagedContentInfo {
    /// Content ID, the first 16 bytes of the content hash
    pub content_id: [u8; 16],
    /// Size of the content in bytes (stored as a 48-bit value)
    #[br(map = |bytes: [u8; 6]| u64::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], 0, 0]))]
    #[bw(map = |&size: &u64| [size as u8, (size >> 8) as u8, (size >> 16) as u8, (size >> 24) as u8, (size >> 32) as u8, (size >> 40) as u8])]
    pub size: u64,
    /// Content type
    pub content_type: PackagedContentType,
    /// ID offset
    pub id_offset: u8,
}

/// Content entry with hash and info.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct PackagedContent {
    /// SHA-256 hash of the content
    pub hash: [u8; 32],
    /// Content info fields (without the hash)
    pub info: PackagedContentInfo,
}

/// Content type of a packaged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum PackagedContentType {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

/// One content record handed to the builder: the NCA hash and size plus the
/// record type. The NCA ID is always the first half of the hash.
#[derive(Debug, Clone)]
pub struct ContentRecord {
    pub hash: [u8; 32],
    pub size: u64,
    pub content_type: PackagedContentType,
}

/// Parsed CNMT.
#[derive(Debug, Clone)]
pub struct Cnmt {
    pub header: CnmtHeader,
    /// Application extended header when `meta_type` is `Application`; raw
    /// bytes otherwise.
    pub extended_header: Option<ApplicationMetaExtendedHeader>,
    pub content_entries: Vec<PackagedContent>,
}

impl Cnmt {
    /// Emit a packaged application CNMT for `records`.
    pub fn build_application(
        title_id: u64,
        title_version: u32,
        records: &[ContentRecord],
    ) -> Result<Vec<u8>> {
        let header = CnmtHeader {
            title_id,
            title_version,
            meta_type: ContentMetaType::Application,
            meta_platform: ContentMetaPlatform::NX,
            extended_header_size: 0x10,
            total_content_entries: records.len() as u16,
            total_content_meta_entries: 0,
            attributes: 0,
            storage_id: 0,
            content_install_type: 0,
            _reserved: 0,
            required_dl_system_version: 0,
            _reserved2: 0,
        };
        let extended = ApplicationMetaExtendedHeader {
            patch_id: title_id + 0x800,
            ..Default::default()
        };

        let mut cursor = Cursor::new(Vec::new());
        header.write_le(&mut cursor)?;
        extended.write_le(&mut cursor)?;
        for record in records {
            let mut content_id = [0u8; 16];
            content_id.copy_from_slice(&record.hash[..16]);
            let entry = PackagedContent {
                hash: record.hash,
                info: PackagedContentInfo {
                    content_id,
                    size: record.size,
                    content_type: record.content_type,
                    id_offset: 0,
                },
            };
            entry.write_le(&mut cursor)?;
        }

        let mut out = cursor.into_inner();
        // Trailing zero digest.
        out.extend_from_slice(&[0u8; 0x20]);

        tracing::debug!(
            title_id = format!("{title_id:016x}"),
            records = records.len(),
            "CNMT built"
        );
        Ok(out)
    }

    /// Parse a CNMT from a reader.
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let header: CnmtHeader = reader.read_le()?;

        let extended_header = if header.meta_type == ContentMetaType::Application {
            Some(reader.read_le::<ApplicationMetaExtendedHeader>()?)
        } else {
            let mut skipped = vec![0; header.extended_header_size as usize];
            reader.read_exact(&mut skipped)?;
            None
        };

        // Content entries start right after the 0x20 header plus the
        // extended header.
        reader.seek(SeekFrom::Start(0x20 + header.extended_header_size as u64))?;
        let mut content_entries = Vec::with_capacity(header.total_content_entries as usize);
        for _ in 0..header.total_content_entries {
            content_entries.push(reader.read_le::<PackagedContent>()?);
        }

        Ok(Cnmt {
            header,
            extended_header,
            content_entries,
        })
    }

    pub fn get_title_id_string(&self) -> String {
        format!("{:016x}", self.header.title_id)
    }

    /// Get content entry by its type.
    pub fn get_content_entry_by_type(
        &self,
        content_type: PackagedContentType,
    ) -> Option<&PackagedContent> {
        self.content_entries
            .iter()
            .find(|entry| entry.info.content_type == content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_cnmt_layout() {
        // One Program record of size 0x100000 for title 0x0100000000001000.
        let mut hash = [0u8; 32];
        for (i, b) in hash.iter_mut().enumerate() {
            *b = i as u8;
        }
        let records = [ContentRecord {
            hash,
            size: 0x100000,
            content_type: PackagedContentType::Program,
        }];
        let data = Cnmt::build_application(0x0100000000001000, 0, &records).unwrap();

        assert_eq!(data.len(), 0x20 + 0x10 + 0x38 + 0x20);
        assert_eq!(
            u64::from_le_bytes(data[0x00..0x08].try_into().unwrap()),
            0x0100000000001000
        );
        assert_eq!(data[0x0C], 0x80); // Application
        assert_eq!(u16::from_le_bytes(data[0x0E..0x10].try_into().unwrap()), 0x10);
        assert_eq!(u16::from_le_bytes(data[0x10..0x12].try_into().unwrap()), 1);
        // Patch title id at the extended header.
        assert_eq!(
            u64::from_le_bytes(data[0x20..0x28].try_into().unwrap()),
            0x0100000000001800
        );
        // Record: hash, nca id = hash[..16], then the split size fields.
        assert_eq!(&data[0x30..0x50], &hash);
        assert_eq!(&data[0x50..0x60], &hash[..16]);
        assert_eq!(&data[0x60..0x64], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(&data[0x64..0x66], &[0x00, 0x00]);
        assert_eq!(data[0x66], PackagedContentType::Program as u8);
        assert_eq!(data[0x67], 0);
        // Zero digest tail.
        assert!(data[0x68..0x88].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_48_bit_size_round_trip() {
        for size in [0u64, 1, 0x100000, 0xFFFF_FFFF_FFFF, 0x8765_4321_0FED] {
            let records = [ContentRecord {
                hash: [7; 32],
                size,
                content_type: PackagedContentType::Data,
            }];
            let data = Cnmt::build_application(0x0100000000002000, 3, &records).unwrap();
            let cnmt = Cnmt::from_reader(&mut Cursor::new(&data)).unwrap();
            assert_eq!(cnmt.content_entries[0].info.size, size);
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let records = [
            ContentRecord {
                hash: [0x11; 32],
                size: 0x1234,
                content_type: PackagedContentType::Program,
            },
            ContentRecord {
                hash: [0x22; 32],
                size: 0x5678,
                content_type: PackagedContentType::Control,
            },
        ];
        let data = Cnmt::build_application(0x0100000000003000, 0x10000, &records).unwrap();
        let cnmt = Cnmt::from_reader(&mut Cursor::new(&data)).unwrap();

        assert_eq!(cnmt.header.title_id, 0x0100000000003000);
        assert_eq!(cnmt.header.title_version, 0x10000);
        assert_eq!(cnmt.header.meta_type, ContentMetaType::Application);
        assert_eq!(cnmt.header.total_content_entries, 2);
        assert_eq!(
            cnmt.extended_header.as_ref().unwrap().patch_id,
            0x0100000000003800
        );
        assert_eq!(cnmt.get_title_id_string(), "0100000000003000");

        let program = cnmt
            .get_content_entry_by_type(PackagedContentType::Program)
            .unwrap();
        assert_eq!(program.info.content_id, [0x11; 16]);
        assert_eq!(program.info.size, 0x1234);
        assert!(cnmt
            .get_content_entry_by_type(PackagedContentType::HtmlDocument)
            .is_none());
    }
}
