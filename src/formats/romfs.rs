//! Nintendo RomFS images: hierarchical read-only filesystems used inside
//! NCA sections.
//!
//! The on-disk layout is a 0x50-byte header, the file data region starting
//! at 0x200, then four tables: directory hash buckets, directory entries,
//! file hash buckets, file entries. Entries reference each other by byte
//! offset into their table; `0xFFFFFFFF` means "none". Lookup goes through
//! the hash buckets, chained via each entry's hash-sibling offset.
//!
//! [`build_romfs`] lays out a [`RomFsEntry`] tree into an image;
//! [`RomFs`] parses one back (hash-bucket lookup included), which is also
//! how the builder is validated.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use binrw::prelude::*;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::io::align_up;

/// Marker for "no entry" in sibling/child/bucket slots.
pub const INVALID_ENTRY: u32 = u32::MAX;

/// Offset of the root directory entry.
pub const ROOT_DIR_OFFSET: u32 = 0;

/// Start of the file data region.
const DATA_PARTITION_OFFSET: u64 = 0x200;

/// Seed for the entry-name hash.
const HASH_SEED: u32 = 0x075BCD15;

/// A node of the filesystem tree handed to the encoder.
///
/// Directory children are kept sorted by name (byte-lexicographic), which is
/// also the serialization order. Names are UTF-8 and must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomFsEntry {
    Dir(BTreeMap<String, RomFsEntry>),
    File(Vec<u8>),
}

impl RomFsEntry {
    /// An empty directory.
    pub fn dir() -> Self {
        RomFsEntry::Dir(BTreeMap::new())
    }

    /// A file node holding `data`.
    pub fn file(data: Vec<u8>) -> Self {
        RomFsEntry::File(data)
    }

    /// Build a flat root directory from `(name, data)` pairs.
    pub fn from_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        RomFsEntry::Dir(
            files
                .into_iter()
                .map(|(name, data)| (name.into(), RomFsEntry::File(data)))
                .collect(),
        )
    }

    /// Insert a node at a `/`-separated path, creating directories on the
    /// way. Panics if a path component exists as a file.
    pub fn insert(&mut self, path: &str, entry: RomFsEntry) {
        let RomFsEntry::Dir(children) = self else {
            panic!("insert into a file node");
        };
        match path.split_once('/') {
            Some((head, rest)) => {
                let child = children
                    .entry(head.to_string())
                    .or_insert_with(RomFsEntry::dir);
                child.insert(rest, entry);
            }
            None => {
                children.insert(path.to_string(), entry);
            }
        }
    }
}

/// Hash-bucket count rule for a table of `n` entries.
fn hash_table_count(n: u32) -> u32 {
    if n < 3 {
        3
    } else if n < 19 {
        n | 1
    } else {
        let mut count = n;
        while [2u32, 3, 5, 7, 11, 13, 17].iter().any(|&p| count % p == 0) {
            count += 1;
        }
        count
    }
}

/// Entry-name hash: seed with the parent entry offset, then fold in each
/// name byte with a rotate-right by 5.
fn entry_hash(parent_offset: u32, name: &[u8]) -> u32 {
    let mut hash = parent_offset ^ HASH_SEED;
    for &b in name {
        hash = hash.rotate_right(5);
        hash ^= b as u32;
    }
    hash
}

struct DirMeta {
    offset: u32,
    parent: u32,
    sibling: u32,
    child_dir: u32,
    child_file: u32,
    hash_sibling: u32,
    name: Vec<u8>,
}

struct FileMeta {
    offset: u32,
    parent: u32,
    sibling: u32,
    data_offset: u64,
    data_size: u64,
    hash_sibling: u32,
    name: Vec<u8>,
}

struct RomFsLayout<'a> {
    dirs: Vec<DirMeta>,
    files: Vec<FileMeta>,
    file_data: Vec<&'a [u8]>,
    dir_table_len: u32,
    file_table_len: u32,
    data_cursor: u64,
}

impl<'a> RomFsLayout<'a> {
    fn new() -> Self {
        Self {
            dirs: Vec::new(),
            files: Vec::new(),
            file_data: Vec::new(),
            dir_table_len: 0,
            file_table_len: 0,
            data_cursor: 0,
        }
    }

    fn alloc_dir(&mut self, parent: u32, name: &str) -> Result<usize> {
        validate_name(name)?;
        let offset = self.dir_table_len;
        self.dir_table_len += 0x18 + align_up(name.len() as u64, 4) as u32;
        self.dirs.push(DirMeta {
            offset,
            parent,
            sibling: INVALID_ENTRY,
            child_dir: INVALID_ENTRY,
            child_file: INVALID_ENTRY,
            hash_sibling: INVALID_ENTRY,
            name: name.as_bytes().to_vec(),
        });
        Ok(self.dirs.len() - 1)
    }

    fn alloc_file(&mut self, parent: u32, name: &str, data: &'a [u8]) -> Result<usize> {
        validate_name(name)?;
        let offset = self.file_table_len;
        self.file_table_len += 0x20 + align_up(name.len() as u64, 4) as u32;
        self.files.push(FileMeta {
            offset,
            parent,
            sibling: INVALID_ENTRY,
            data_offset: self.data_cursor,
            data_size: data.len() as u64,
            hash_sibling: INVALID_ENTRY,
            name: name.as_bytes().to_vec(),
        });
        self.file_data.push(data);
        self.data_cursor += align_up(data.len() as u64, 0x10);
        Ok(self.files.len() - 1)
    }

    /// Depth-first walk in sorted name order, assigning entry and data
    /// offsets and linking the per-directory sibling chains.
    fn walk(&mut self, children: &'a BTreeMap<String, RomFsEntry>, self_idx: usize) -> Result<()> {
        let parent_offset = self.dirs[self_idx].offset;
        let mut prev_dir: Option<usize> = None;
        let mut prev_file: Option<usize> = None;

        for (name, child) in children {
            match child {
                RomFsEntry::Dir(grandchildren) => {
                    let idx = self.alloc_dir(parent_offset, name)?;
                    let offset = self.dirs[idx].offset;
                    match prev_dir {
                        Some(prev) => self.dirs[prev].sibling = offset,
                        None => self.dirs[self_idx].child_dir = offset,
                    }
                    prev_dir = Some(idx);
                    self.walk(grandchildren, idx)?;
                }
                RomFsEntry::File(data) => {
                    let idx = self.alloc_file(parent_offset, name, data)?;
                    let offset = self.files[idx].offset;
                    match prev_file {
                        Some(prev) => self.files[prev].sibling = offset,
                        None => self.dirs[self_idx].child_file = offset,
                    }
                    prev_file = Some(idx);
                }
            }
        }
        Ok(())
    }

    /// Chain every entry into its hash bucket. The bucket head ends up
    /// pointing at the most recently inserted entry; earlier entries are
    /// reachable through the hash-sibling offsets.
    fn build_buckets(&mut self) -> (Vec<u32>, Vec<u32>) {
        let dir_buckets = hash_table_count(self.dirs.len() as u32) as usize;
        let file_buckets = hash_table_count(self.files.len() as u32) as usize;
        let mut dir_table = vec![INVALID_ENTRY; dir_buckets];
        let mut file_table = vec![INVALID_ENTRY; file_buckets];

        for dir in &mut self.dirs {
            let bucket = (entry_hash(dir.parent, &dir.name) as usize) % dir_buckets;
            dir.hash_sibling = dir_table[bucket];
            dir_table[bucket] = dir.offset;
        }
        for file in &mut self.files {
            let bucket = (entry_hash(file.parent, &file.name) as usize) % file_buckets;
            file.hash_sibling = file_table[bucket];
            file_table[bucket] = file.offset;
        }

        (dir_table, file_table)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.contains('/') {
        return Err(Error::InvalidFieldRange {
            field: "RomFS entry name",
            value: b'/' as u64,
        });
    }
    Ok(())
}

/// Encode a [`RomFsEntry`] tree into a RomFS image.
pub fn build_romfs(root: &RomFsEntry) -> Result<Vec<u8>> {
    let RomFsEntry::Dir(children) = root else {
        return Err(Error::MissingInput {
            name: "RomFS root directory".to_string(),
        });
    };

    let mut layout = RomFsLayout::new();
    // Root entry: empty name, parent = self = offset 0.
    let root_idx = layout.alloc_dir(ROOT_DIR_OFFSET, "")?;
    layout.walk(children, root_idx)?;
    let (dir_buckets, file_buckets) = layout.build_buckets();

    // No padding after the last file.
    let file_partition_size = layout
        .files
        .last()
        .map(|f| f.data_offset + f.data_size)
        .unwrap_or(0);

    let dir_hash_table_ofs = align_up(file_partition_size + DATA_PARTITION_OFFSET, 4);
    let dir_hash_table_size = 4 * dir_buckets.len() as u64;
    let dir_table_ofs = dir_hash_table_ofs + dir_hash_table_size;
    let dir_table_size = layout.dir_table_len as u64;
    let file_hash_table_ofs = dir_table_ofs + dir_table_size;
    let file_hash_table_size = 4 * file_buckets.len() as u64;
    let file_table_ofs = file_hash_table_ofs + file_hash_table_size;
    let file_table_size = layout.file_table_len as u64;
    let total_size = file_table_ofs + file_table_size;

    let mut out = Vec::with_capacity(total_size as usize);

    // Header: ten u64 fields, 0x50 bytes.
    out.write_u64::<LittleEndian>(0x50)?;
    out.write_u64::<LittleEndian>(dir_hash_table_ofs)?;
    out.write_u64::<LittleEndian>(dir_hash_table_size)?;
    out.write_u64::<LittleEndian>(dir_table_ofs)?;
    out.write_u64::<LittleEndian>(dir_table_size)?;
    out.write_u64::<LittleEndian>(file_hash_table_ofs)?;
    out.write_u64::<LittleEndian>(file_hash_table_size)?;
    out.write_u64::<LittleEndian>(file_table_ofs)?;
    out.write_u64::<LittleEndian>(file_table_size)?;
    out.write_u64::<LittleEndian>(DATA_PARTITION_OFFSET)?;

    out.resize(DATA_PARTITION_OFFSET as usize, 0);
    for (meta, data) in layout.files.iter().zip(layout.file_data.iter()) {
        debug_assert_eq!(out.len() as u64, DATA_PARTITION_OFFSET + meta.data_offset);
        out.extend_from_slice(data);
        out.resize(
            (DATA_PARTITION_OFFSET + align_up(meta.data_offset + meta.data_size, 0x10)) as usize,
            0,
        );
    }
    // The loop above padded the last file to 16; the table region only needs
    // 4-byte alignment, so this may shrink back over trailing zeros.
    out.resize(dir_hash_table_ofs as usize, 0);

    for bucket in &dir_buckets {
        out.write_u32::<LittleEndian>(*bucket)?;
    }
    for dir in &layout.dirs {
        out.write_u32::<LittleEndian>(dir.parent)?;
        out.write_u32::<LittleEndian>(dir.sibling)?;
        out.write_u32::<LittleEndian>(dir.child_dir)?;
        out.write_u32::<LittleEndian>(dir.child_file)?;
        out.write_u32::<LittleEndian>(dir.hash_sibling)?;
        out.write_u32::<LittleEndian>(dir.name.len() as u32)?;
        out.extend_from_slice(&dir.name);
        out.resize(align_up(out.len() as u64, 4) as usize, 0);
    }
    for bucket in &file_buckets {
        out.write_u32::<LittleEndian>(*bucket)?;
    }
    for file in &layout.files {
        out.write_u32::<LittleEndian>(file.parent)?;
        out.write_u32::<LittleEndian>(file.sibling)?;
        out.write_u64::<LittleEndian>(file.data_offset)?;
        out.write_u64::<LittleEndian>(file.data_size)?;
        out.write_u32::<LittleEndian>(file.hash_sibling)?;
        out.write_u32::<LittleEndian>(file.name.len() as u32)?;
        out.extend_from_slice(&file.name);
        out.resize(align_up(out.len() as u64, 4) as usize, 0);
    }

    debug_assert_eq!(out.len() as u64, total_size);
    tracing::debug!(
        dirs = layout.dirs.len(),
        files = layout.files.len(),
        size = out.len(),
        "RomFS image built"
    );
    Ok(out)
}

/// RomFS header structure (the 0x50-byte all-u64 variant).
#[binrw]
#[derive(Debug, Clone)]
#[brw(little)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u64,
    pub dir_table_offset: u64,
    pub dir_table_size: u64,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u64,
    pub file_table_offset: u64,
    pub file_table_size: u64,
    pub file_data_offset: u64,
}

/// Parsed directory entry.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub child_dir_offset: u32,
    pub child_file_offset: u32,
    pub hash_sibling_offset: u32,
    pub name: String,
}

/// Parsed file entry.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub hash_sibling_offset: u32,
    pub name: String,
}

/// RomFS parser.
pub struct RomFs<R: Read + Seek> {
    reader: R,
    pub header: RomFsHeader,
    dir_hash_table: Vec<u32>,
    file_hash_table: Vec<u32>,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
}

impl<R: Read + Seek> RomFs<R> {
    /// Parse the header and entry tables from a reader positioned at the
    /// image start.
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let header: RomFsHeader = reader.read_le()?;
        if header.header_size != 0x50 {
            return Err(Error::InvalidFieldRange {
                field: "RomFS header size",
                value: header.header_size,
            });
        }
        // Guard table allocations against corrupt headers.
        const MAX_TABLE_SIZE: u64 = 0x1000_0000;
        for (size, field) in [
            (header.dir_hash_table_size, "RomFS dir hash table size"),
            (header.dir_table_size, "RomFS dir table size"),
            (header.file_hash_table_size, "RomFS file hash table size"),
            (header.file_table_size, "RomFS file table size"),
        ] {
            if size > MAX_TABLE_SIZE {
                return Err(Error::InvalidFieldRange { field, value: size });
            }
        }

        let read_region = |reader: &mut R, offset: u64, size: u64| -> Result<Vec<u8>> {
            reader.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; size as usize];
            reader.read_exact(&mut buf)?;
            Ok(buf)
        };

        let dir_hash_bytes =
            read_region(&mut reader, header.dir_hash_table_offset, header.dir_hash_table_size)?;
        let file_hash_bytes = read_region(
            &mut reader,
            header.file_hash_table_offset,
            header.file_hash_table_size,
        )?;
        let dir_table = read_region(&mut reader, header.dir_table_offset, header.dir_table_size)?;
        let file_table =
            read_region(&mut reader, header.file_table_offset, header.file_table_size)?;

        let as_u32_table = |bytes: &[u8]| {
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect::<Vec<u32>>()
        };

        tracing::trace!(
            dir_buckets = header.dir_hash_table_size / 4,
            file_buckets = header.file_hash_table_size / 4,
            "RomFS tables loaded"
        );

        Ok(Self {
            reader,
            header,
            dir_hash_table: as_u32_table(&dir_hash_bytes),
            file_hash_table: as_u32_table(&file_hash_bytes),
            dir_table,
            file_table,
        })
    }

    fn read_dir_entry(&self, offset: u32) -> Result<DirectoryEntry> {
        let mut cursor = Cursor::new(&self.dir_table);
        cursor.seek(SeekFrom::Start(offset as u64))?;

        let parent_offset: u32 = cursor.read_le()?;
        let sibling_offset: u32 = cursor.read_le()?;
        let child_dir_offset: u32 = cursor.read_le()?;
        let child_file_offset: u32 = cursor.read_le()?;
        let hash_sibling_offset: u32 = cursor.read_le()?;
        let name_size: u32 = cursor.read_le()?;

        let mut name_bytes = vec![0u8; name_size as usize];
        cursor.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|_| Error::InvalidFieldRange {
            field: "RomFS dir name",
            value: offset as u64,
        })?;

        Ok(DirectoryEntry {
            parent_offset,
            sibling_offset,
            child_dir_offset,
            child_file_offset,
            hash_sibling_offset,
            name,
        })
    }

    fn read_file_entry(&self, offset: u32) -> Result<FileEntry> {
        let mut cursor = Cursor::new(&self.file_table);
        cursor.seek(SeekFrom::Start(offset as u64))?;

        let parent_offset: u32 = cursor.read_le()?;
        let sibling_offset: u32 = cursor.read_le()?;
        let data_offset: u64 = cursor.read_le()?;
        let data_size: u64 = cursor.read_le()?;
        let hash_sibling_offset: u32 = cursor.read_le()?;
        let name_size: u32 = cursor.read_le()?;

        let mut name_bytes = vec![0u8; name_size as usize];
        cursor.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|_| Error::InvalidFieldRange {
            field: "RomFS file name",
            value: offset as u64,
        })?;

        Ok(FileEntry {
            parent_offset,
            sibling_offset,
            data_offset,
            data_size,
            hash_sibling_offset,
            name,
        })
    }

    /// Find a directory offset by walking the hash buckets for each path
    /// component.
    pub fn find_dir(&self, path: &str) -> Result<u32> {
        let mut current = ROOT_DIR_OFFSET;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.find_dir_in_parent(current, part)?;
        }
        Ok(current)
    }

    fn find_dir_in_parent(&self, parent_offset: u32, name: &str) -> Result<u32> {
        let bucket =
            (entry_hash(parent_offset, name.as_bytes()) as usize) % self.dir_hash_table.len();
        let mut current = self.dir_hash_table[bucket];
        while current != INVALID_ENTRY {
            let entry = self.read_dir_entry(current)?;
            if entry.parent_offset == parent_offset && entry.name == name {
                return Ok(current);
            }
            current = entry.hash_sibling_offset;
        }
        Err(Error::MissingInput {
            name: name.to_string(),
        })
    }

    fn find_file_in_dir(&self, parent_offset: u32, name: &str) -> Result<FileEntry> {
        let bucket =
            (entry_hash(parent_offset, name.as_bytes()) as usize) % self.file_hash_table.len();
        let mut current = self.file_hash_table[bucket];
        while current != INVALID_ENTRY {
            let entry = self.read_file_entry(current)?;
            if entry.parent_offset == parent_offset && entry.name == name {
                return Ok(entry);
            }
            current = entry.hash_sibling_offset;
        }
        Err(Error::MissingInput {
            name: name.to_string(),
        })
    }

    /// Look a file up by `/`-separated path through the hash tables.
    pub fn get_file_by_path(&self, path: &str) -> Result<FileEntry> {
        let (parent_path, file_name) = match path.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", path),
        };
        let parent = self.find_dir(parent_path)?;
        self.find_file_in_dir(parent, file_name)
    }

    /// Read a file's data region.
    pub fn read_file(&mut self, entry: &FileEntry) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(
            self.header.file_data_offset + entry.data_offset,
        ))?;
        let mut data = vec![0u8; entry.data_size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reconstruct the full tree. Inverse of [`build_romfs`] up to child
    /// ordering (which serialization already sorts).
    pub fn decode_tree(&mut self) -> Result<RomFsEntry> {
        self.decode_dir(ROOT_DIR_OFFSET)
    }

    fn decode_dir(&mut self, offset: u32) -> Result<RomFsEntry> {
        let entry = self.read_dir_entry(offset)?;
        let mut children = BTreeMap::new();

        let mut file_offset = entry.child_file_offset;
        while file_offset != INVALID_ENTRY {
            let file = self.read_file_entry(file_offset)?;
            let data = self.read_file(&file)?;
            children.insert(file.name.clone(), RomFsEntry::File(data));
            file_offset = file.sibling_offset;
        }

        let mut dir_offset = entry.child_dir_offset;
        while dir_offset != INVALID_ENTRY {
            let dir = self.read_dir_entry(dir_offset)?;
            let subtree = self.decode_dir(dir_offset)?;
            children.insert(dir.name.clone(), subtree);
            dir_offset = dir.sibling_offset;
        }

        Ok(RomFsEntry::Dir(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> RomFsEntry {
        let mut root = RomFsEntry::dir();
        root.insert("readme.txt", RomFsEntry::file(b"hello romfs".to_vec()));
        root.insert("data/level1.bin", RomFsEntry::file(vec![0xAA; 0x31]));
        root.insert("data/level2.bin", RomFsEntry::file(vec![0xBB; 0x10]));
        root.insert("data/sub/deep.bin", RomFsEntry::file(vec![0xCC; 5]));
        root.insert("empty.bin", RomFsEntry::file(Vec::new()));
        root
    }

    #[test]
    fn test_hash_table_count_rule() {
        assert_eq!(hash_table_count(0), 3);
        assert_eq!(hash_table_count(2), 3);
        assert_eq!(hash_table_count(3), 3);
        assert_eq!(hash_table_count(4), 5);
        assert_eq!(hash_table_count(18), 19);
        // 19 and up: smallest value not divisible by the small primes.
        assert_eq!(hash_table_count(19), 19);
        assert_eq!(hash_table_count(20), 23);
        assert_eq!(hash_table_count(21), 23);
    }

    #[test]
    fn test_header_fields() {
        let image = build_romfs(&sample_tree()).unwrap();
        let header: RomFsHeader = Cursor::new(&image).read_le().unwrap();

        assert_eq!(header.header_size, 0x50);
        assert_eq!(header.file_data_offset, 0x200);
        assert_eq!(header.dir_hash_table_size % 4, 0);
        assert_eq!(header.file_hash_table_size % 4, 0);
        assert!(header.dir_hash_table_offset >= 0x200);
        assert_eq!(
            header.dir_table_offset,
            header.dir_hash_table_offset + header.dir_hash_table_size
        );
        assert_eq!(
            header.file_hash_table_offset,
            header.dir_table_offset + header.dir_table_size
        );
        assert_eq!(
            header.file_table_offset,
            header.file_hash_table_offset + header.file_hash_table_size
        );
        assert_eq!(
            image.len() as u64,
            header.file_table_offset + header.file_table_size
        );
    }

    #[test]
    fn test_round_trip() {
        let tree = sample_tree();
        let image = build_romfs(&tree).unwrap();
        let mut romfs = RomFs::from_reader(Cursor::new(image)).unwrap();
        assert_eq!(romfs.decode_tree().unwrap(), tree);
    }

    #[test]
    fn test_path_lookup_via_hash_buckets() {
        let image = build_romfs(&sample_tree()).unwrap();
        let mut romfs = RomFs::from_reader(Cursor::new(image)).unwrap();

        let entry = romfs.get_file_by_path("data/sub/deep.bin").unwrap();
        assert_eq!(entry.data_size, 5);
        assert_eq!(romfs.read_file(&entry).unwrap(), vec![0xCC; 5]);

        let entry = romfs.get_file_by_path("readme.txt").unwrap();
        assert_eq!(romfs.read_file(&entry).unwrap(), b"hello romfs");

        assert!(romfs.get_file_by_path("data/nope.bin").is_err());
        assert!(romfs.get_file_by_path("nodir/deep.bin").is_err());
    }

    #[test]
    fn test_file_data_alignment() {
        let image = build_romfs(&sample_tree()).unwrap();
        let romfs = RomFs::from_reader(Cursor::new(image)).unwrap();

        // Every data offset is 16-byte aligned and strictly increasing in
        // table order.
        let mut offsets = Vec::new();
        let mut cursor = 0u32;
        while (cursor as u64) < romfs.header.file_table_size {
            let entry = romfs.read_file_entry(cursor).unwrap();
            assert_eq!(entry.data_offset % 0x10, 0, "unaligned {:?}", entry.name);
            offsets.push(entry.data_offset);
            cursor += 0x20 + align_up(entry.name.len() as u64, 4) as u32;
        }
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_children_serialized_sorted() {
        // Sibling chains follow byte-lexicographic name order.
        let mut root = RomFsEntry::dir();
        root.insert("zeta", RomFsEntry::file(vec![1]));
        root.insert("alpha", RomFsEntry::file(vec![2]));
        root.insert("Beta", RomFsEntry::file(vec![3]));

        let image = build_romfs(&root).unwrap();
        let romfs = RomFs::from_reader(Cursor::new(image)).unwrap();
        let root_entry = romfs.read_dir_entry(ROOT_DIR_OFFSET).unwrap();

        let mut names = Vec::new();
        let mut offset = root_entry.child_file_offset;
        while offset != INVALID_ENTRY {
            let file = romfs.read_file_entry(offset).unwrap();
            names.push(file.name.clone());
            offset = file.sibling_offset;
        }
        assert_eq!(names, vec!["Beta", "alpha", "zeta"]);
    }

    #[test]
    fn test_empty_tree() {
        let image = build_romfs(&RomFsEntry::dir()).unwrap();
        let mut romfs = RomFs::from_reader(Cursor::new(image)).unwrap();
        assert_eq!(romfs.decode_tree().unwrap(), RomFsEntry::dir());
    }

    #[test]
    fn test_name_with_slash_rejected() {
        let mut children = BTreeMap::new();
        children.insert("bad/name".to_string(), RomFsEntry::file(vec![]));
        let root = RomFsEntry::Dir(children);
        assert!(matches!(
            build_romfs(&root),
            Err(Error::InvalidFieldRange { .. })
        ));
    }
}
