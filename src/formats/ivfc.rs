//! IVFC (hierarchical integrity) hash trees for RomFS NCA sections.
//!
//! Six hash levels are produced bottom-up over 0x4000-byte blocks: level 6
//! is the data itself, level 5 hashes its blocks, and so on up to level 1,
//! whose padded image is hashed once more into the master hash stored in
//! the superblock. Levels 1..5 are stored in front of the data inside the
//! section, each padded to a 0x4000 boundary.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::io::align_up;

/// IVFC block size (and its log2) used for every level.
pub const IVFC_BLOCK_SIZE: u64 = 0x4000;
const IVFC_BLOCK_SIZE_LOG2: u32 = 0x0E;

/// Number of stored hash levels (level 6 is the data itself).
const HASH_LEVEL_COUNT: usize = 5;

/// Result of building the hash tree over a section's data.
pub struct Ivfc {
    /// The 0xE0-byte IVFC header placed in the fs-header superblock.
    pub header: [u8; 0xE0],
    /// Hash levels 1 (top) through 5 (bottom), each padded to 0x4000.
    pub levels: Vec<Vec<u8>>,
    /// Original (unpadded) data length, reported in the data descriptor.
    pub data_len: u64,
}

impl Ivfc {
    /// Total stored size of the hash levels.
    pub fn levels_len(&self) -> u64 {
        self.levels.iter().map(|l| l.len() as u64).sum()
    }
}

/// Build the IVFC tree over `data`, which must already be padded to a
/// 0x4000 boundary.
pub fn build_ivfc(data: &[u8]) -> Result<Ivfc> {
    if data.len() as u64 % IVFC_BLOCK_SIZE != 0 {
        return Err(Error::Misaligned { what: "IVFC data" });
    }

    // Bottom-up: level 5 hashes the data, each level above hashes the
    // padded level below.
    let mut levels_bottom_up: Vec<Vec<u8>> = Vec::with_capacity(HASH_LEVEL_COUNT);
    for i in 0..HASH_LEVEL_COUNT {
        let mut level = hash_blocks(match i {
            0 => data,
            _ => &levels_bottom_up[i - 1],
        });
        level.resize(align_up(level.len() as u64, IVFC_BLOCK_SIZE) as usize, 0);
        levels_bottom_up.push(level);
    }

    let master_hash = sha256(levels_bottom_up.last().unwrap());

    // Store top-down: level 1 first.
    levels_bottom_up.reverse();
    let levels = levels_bottom_up;

    let mut header = [0u8; 0xE0];
    header[0x00..0x04].copy_from_slice(b"IVFC");
    LittleEndian::write_u32(&mut header[0x04..0x08], 0x20000);
    LittleEndian::write_u32(&mut header[0x08..0x0C], 0x20);
    LittleEndian::write_u32(&mut header[0x0C..0x10], (HASH_LEVEL_COUNT + 2) as u32);

    // Six level descriptors: the five stored hash levels plus the data
    // level. Logical offsets are cumulative over the stored sizes; the data
    // descriptor reports the unpadded length.
    let mut logical_offset = 0u64;
    for (i, size) in levels
        .iter()
        .map(|l| l.len() as u64)
        .chain(std::iter::once(data.len() as u64))
        .enumerate()
    {
        let desc = &mut header[0x10 + i * 0x18..0x10 + (i + 1) * 0x18];
        LittleEndian::write_u64(&mut desc[0x00..0x08], logical_offset);
        LittleEndian::write_u64(&mut desc[0x08..0x10], size);
        LittleEndian::write_u32(&mut desc[0x10..0x14], IVFC_BLOCK_SIZE_LOG2);
        logical_offset += size;
    }

    header[0xC0..0xE0].copy_from_slice(&master_hash);

    Ok(Ivfc {
        header,
        levels,
        data_len: data.len() as u64,
    })
}

fn hash_blocks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().div_ceil(IVFC_BLOCK_SIZE as usize) * 0x20);
    for block in data.chunks(IVFC_BLOCK_SIZE as usize) {
        out.extend_from_slice(&sha256(block));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unaligned_data() {
        assert!(matches!(
            build_ivfc(&[0u8; 0x4001]),
            Err(Error::Misaligned { .. })
        ));
    }

    #[test]
    fn test_single_block() {
        let data = vec![0x5Au8; 0x4000];
        let ivfc = build_ivfc(&data).unwrap();

        assert_eq!(&ivfc.header[0..4], b"IVFC");
        assert_eq!(LittleEndian::read_u32(&ivfc.header[0x04..]), 0x20000);
        assert_eq!(LittleEndian::read_u32(&ivfc.header[0x08..]), 0x20);
        assert_eq!(LittleEndian::read_u32(&ivfc.header[0x0C..]), 7);

        assert_eq!(ivfc.levels.len(), 5);
        assert!(ivfc.levels.iter().all(|l| l.len() == 0x4000));
        assert_eq!(ivfc.data_len, 0x4000);

        // Level 5 (stored last) starts with the hash of the data block.
        assert_eq!(&ivfc.levels[4][..0x20], &sha256(&data));
        // Master hash covers padded level 1.
        assert_eq!(&ivfc.header[0xC0..0xE0], &sha256(&ivfc.levels[0]));
    }

    #[test]
    fn test_level_chaining() {
        // With three data blocks, level 5 holds three hashes and every level
        // above hashes the padded image of the level below.
        let mut data = vec![0u8; 0x4000 * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let ivfc = build_ivfc(&data).unwrap();

        let level5 = &ivfc.levels[4];
        assert_eq!(&level5[0x00..0x20], &sha256(&data[0x0000..0x4000]));
        assert_eq!(&level5[0x20..0x40], &sha256(&data[0x4000..0x8000]));
        assert_eq!(&level5[0x40..0x60], &sha256(&data[0x8000..0xC000]));
        assert!(level5[0x60..].iter().all(|&b| b == 0));

        let level4 = &ivfc.levels[3];
        assert_eq!(&level4[..0x20], &sha256(level5));
    }

    #[test]
    fn test_descriptor_offsets() {
        let data = vec![1u8; 0x8000];
        let ivfc = build_ivfc(&data).unwrap();

        let mut expected_offset = 0u64;
        for i in 0..6 {
            let desc = &ivfc.header[0x10 + i * 0x18..0x10 + (i + 1) * 0x18];
            assert_eq!(LittleEndian::read_u64(&desc[0x00..]), expected_offset);
            let size = LittleEndian::read_u64(&desc[0x08..]);
            if i < 5 {
                assert_eq!(size, ivfc.levels[i].len() as u64);
            } else {
                assert_eq!(size, 0x8000);
            }
            assert_eq!(LittleEndian::read_u32(&desc[0x10..]), 0x0E);
            assert_eq!(LittleEndian::read_u32(&desc[0x14..]), 0);
            expected_offset += size;
        }
        assert_eq!(ivfc.levels_len(), 5 * 0x4000);
    }
}
