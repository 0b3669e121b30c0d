//! XCI (game card image) locator.
//!
//! Only the container layer is handled here: the `HEAD` magic at 0x100
//! identifies a card image, and the root HFS0 sits at 0xF000 (with a
//! fallback probe at 0x10000 for older dump layouts). Each root entry is a
//! sub-HFS0 partition; the `secure` partition carries the NCAs and is
//! surfaced as the primary file map.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::formats::hfs0::Hfs0;
use crate::io::{SharedReader, SubFile};

/// Offset of the `HEAD` magic within the card header.
const HEAD_MAGIC_OFFSET: u64 = 0x100;

/// Candidate offsets of the root HFS0.
const ROOT_HFS0_OFFSETS: [u64; 2] = [0xF000, 0x10000];

/// XCI file representation.
pub struct Xci<R: Read + Seek> {
    reader: SharedReader<R>,
    /// Root partition table (entries are sub-HFS0 partitions).
    pub root: Hfs0<SubFile<SharedReader<R>>>,
    root_offset: u64,
}

impl<R: Read + Seek> Xci<R> {
    /// Open a card image: validate the header magic, then locate the root
    /// HFS0 at its primary offset with one fallback probe.
    pub fn new(reader: R) -> Result<Self> {
        let reader = SharedReader::new(reader);

        let mut magic = [0u8; 4];
        {
            let mut r = reader.clone();
            r.seek(SeekFrom::Start(HEAD_MAGIC_OFFSET))?;
            r.read_exact(&mut magic)?;
        }
        if &magic != b"HEAD" {
            return Err(Error::InvalidMagic { location: "XCI" });
        }

        let end = {
            let mut r = reader.clone();
            r.seek(SeekFrom::End(0))?
        };

        let mut last_err = Error::InvalidMagic { location: "HFS0" };
        for offset in ROOT_HFS0_OFFSETS {
            match Hfs0::new(reader.sub_file(offset, end)) {
                Ok(root) => {
                    tracing::trace!(offset = format!("{offset:#x}"), "root HFS0 located");
                    return Ok(Self {
                        reader,
                        root,
                        root_offset: offset,
                    });
                }
                Err(err) => {
                    tracing::trace!(
                        offset = format!("{offset:#x}"),
                        %err,
                        "root HFS0 probe failed"
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Names of the root partitions.
    pub fn partitions(&self) -> Result<Vec<String>> {
        Ok(self
            .root
            .list_files()?
            .into_iter()
            .map(|f| f.name)
            .collect())
    }

    /// Open a named partition as its own HFS0.
    pub fn open_partition(&self, name: &str) -> Result<Option<Hfs0<SubFile<SharedReader<R>>>>> {
        let Some(file) = self.root.get_file(name)? else {
            return Ok(None);
        };
        let start = self.root_offset + file.offset;
        let partition = Hfs0::new(self.reader.sub_file(start, start + file.size))?;
        Ok(Some(partition))
    }

    /// The `secure` partition, the primary file map of a card.
    pub fn secure_partition(&self) -> Result<Hfs0<SubFile<SharedReader<R>>>> {
        self.open_partition("secure")?.ok_or_else(|| Error::MissingInput {
            name: "secure".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::hfs0::build_test_hfs0;
    use std::io::Cursor;

    fn build_test_xci(root_offset: u64) -> Vec<u8> {
        let secure = build_test_hfs0(&[("title.nca", &[0xAB; 0x80])]);
        let normal = build_test_hfs0(&[]);
        let root = build_test_hfs0(&[("normal", &normal), ("secure", &secure)]);

        let mut image = vec![0u8; root_offset as usize];
        image[0x100..0x104].copy_from_slice(b"HEAD");
        image.extend_from_slice(&root);
        image
    }

    #[test]
    fn test_open_and_secure_partition() {
        let xci = Xci::new(Cursor::new(build_test_xci(0xF000))).unwrap();
        assert_eq!(xci.partitions().unwrap(), vec!["normal", "secure"]);

        let mut secure = xci.secure_partition().unwrap();
        let files = secure.list_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "title.nca");
        let nca = secure.get_file("title.nca").unwrap().unwrap();
        assert_eq!(secure.read_to_vec(&nca).unwrap(), vec![0xAB; 0x80]);
    }

    #[test]
    fn test_fallback_root_offset() {
        let xci = Xci::new(Cursor::new(build_test_xci(0x10000))).unwrap();
        assert_eq!(xci.partitions().unwrap(), vec!["normal", "secure"]);
    }

    #[test]
    fn test_missing_head_magic() {
        let image = vec![0u8; 0x20000];
        assert!(matches!(
            Xci::new(Cursor::new(image)),
            Err(Error::InvalidMagic { location: "XCI" })
        ));
    }

    #[test]
    fn test_missing_secure_partition() {
        let root = build_test_hfs0(&[("update", &[0u8; 4])]);
        let mut image = vec![0u8; 0xF000];
        image[0x100..0x104].copy_from_slice(b"HEAD");
        image.extend_from_slice(&root);

        let xci = Xci::new(Cursor::new(image)).unwrap();
        assert!(matches!(
            xci.secure_partition(),
            Err(Error::MissingInput { .. })
        ));
    }
}
