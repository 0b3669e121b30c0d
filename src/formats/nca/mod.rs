//! NCA3 assembly: sections, headers, hashes, signatures and the layered
//! encryption passes.
//!
//! The first 0xC00 bytes of an NCA are AES-XTS encrypted with sector size
//! 0x200 and Nintendo's big-endian tweak; they hold a 0x400 main header
//! (signatures + the signed region) plus one 0x200 fs header per section.
//! Section bodies follow from offset 0xC00, padded to media units of 0x200
//! bytes, and are AES-CTR encrypted with the plaintext key stored (then
//! ECB-wrapped) in the header key area.
//!
//! Assembly ordering matters and is fixed: fs headers are finalized before
//! the section hashes are computed, the signature covers the still-plaintext
//! signed region, CTR encryption runs over the signed envelope, the key
//! area is wrapped, and the XTS pass over the header comes last.

pub mod types;

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::{aes_ctr_apply, aes_ecb_encrypt, aes_xts_decrypt, aes_xts_encrypt, sha256, NcaSigner};
use crate::error::{Error, Result};
use crate::formats::ivfc::build_ivfc;
use crate::formats::keyset::{KaekIndex, Keyset};
use crate::formats::pfs0::Pfs0HashTable;
use crate::io::align_up;

pub use types::*;

/// NCA media unit: every section body is padded to this.
pub const MEDIA_UNIT: u64 = 0x200;

/// Size of the encrypted header region.
pub const NCA_HEADER_SIZE: usize = 0xC00;

/// A section body with its finalized superblock, ready for assembly.
pub struct NcaSectionData {
    data: Vec<u8>,
    fs_header: [u8; 0x200],
    encryption: EncryptionType,
}

impl NcaSectionData {
    /// Body length padded to media units.
    fn padded_len(&self) -> u64 {
        align_up(self.data.len() as u64, MEDIA_UNIT)
    }
}

/// Prepare a PFS0 section: the body is the block hash table (padded to
/// 0x200) followed by the PFS0 image.
pub fn pfs0_section(image: Vec<u8>, block_size: u32, encryption: EncryptionType) -> NcaSectionData {
    let table = Pfs0HashTable::create(&image, block_size);
    let master_hash = table.master_hash();

    let mut data = table.table;
    let pfs0_offset = data.len() as u64;
    data.extend_from_slice(&image);

    let mut fs_header = [0u8; 0x200];
    LittleEndian::write_u16(&mut fs_header[0x00..], 2); // version
    fs_header[0x02] = FsType::PartitionFs as u8;
    fs_header[0x03] = HashType::HierarchicalSha256Hash as u8;

    // HierarchicalSha256 superblock.
    let superblock = &mut fs_header[0x08..0x100];
    superblock[0x00..0x20].copy_from_slice(&master_hash);
    LittleEndian::write_u32(&mut superblock[0x20..], block_size);
    LittleEndian::write_u32(&mut superblock[0x24..], 2); // layer count
    LittleEndian::write_u64(&mut superblock[0x28..], 0); // hash table offset
    LittleEndian::write_u64(&mut superblock[0x30..], table.hash_data_size);
    LittleEndian::write_u64(&mut superblock[0x38..], pfs0_offset);
    LittleEndian::write_u64(&mut superblock[0x40..], image.len() as u64);

    NcaSectionData {
        data,
        fs_header,
        encryption,
    }
}

/// Prepare a RomFS section: the body is the five stored IVFC hash levels
/// followed by the (0x4000-aligned) image, with the IVFC header as the
/// superblock.
pub fn romfs_section(image: Vec<u8>) -> Result<NcaSectionData> {
    let ivfc = build_ivfc(&image)?;

    let mut data = Vec::with_capacity((ivfc.levels_len() + ivfc.data_len) as usize);
    for level in &ivfc.levels {
        data.extend_from_slice(level);
    }
    data.extend_from_slice(&image);

    let mut fs_header = [0u8; 0x200];
    LittleEndian::write_u16(&mut fs_header[0x00..], 2); // version
    fs_header[0x02] = FsType::RomFs as u8;
    fs_header[0x03] = HashType::HierarchicalIntegrityHash as u8;
    fs_header[0x08..0x08 + 0xE0].copy_from_slice(&ivfc.header);

    Ok(NcaSectionData {
        data,
        fs_header,
        encryption: EncryptionType::AesCtr,
    })
}

/// Assembly parameters shared by every NCA of a build session.
pub struct NcaParams<'a> {
    pub content_type: ContentType,
    pub title_id: u64,
    pub sdk_version: u32,
    /// Key generation, 1-based as stored in keyfiles plus one; selects
    /// `key_area_key_application_{generation-1}`.
    pub key_generation: u8,
    /// Plaintext content key placed in key-area slot 2 before wrapping.
    pub key_area_key: [u8; 0x10],
    pub keyset: &'a Keyset,
    /// Sign the header (second signature slot) when present.
    pub signer: Option<&'a NcaSigner>,
    /// Skip section encryption (headers are still always encrypted).
    pub plaintext: bool,
}

/// A finished NCA.
#[derive(Debug)]
pub struct BuiltNca {
    pub bytes: Vec<u8>,
    /// SHA-256 of the finished (encrypted) envelope.
    pub hash: [u8; 0x20],
    /// First 16 bytes of the hash; the package file name stem.
    pub nca_id: [u8; 0x10],
}

impl BuiltNca {
    pub fn nca_id_hex(&self) -> String {
        hex::encode(self.nca_id)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Assemble, hash, sign and encrypt an NCA from prepared sections.
pub fn build_nca(params: &NcaParams, sections: Vec<NcaSectionData>) -> Result<BuiltNca> {
    if params.key_generation < 1 || params.key_generation as usize > 0x20 {
        return Err(Error::InvalidFieldRange {
            field: "NCA key generation",
            value: params.key_generation as u64,
        });
    }
    if sections.is_empty() || sections.len() > 4 {
        return Err(Error::InvalidFieldRange {
            field: "NCA section count",
            value: sections.len() as u64,
        });
    }

    let header_key = params.keyset.header_key().ok_or_else(|| Error::MissingInput {
        name: "header_key".to_string(),
    })?;
    let wrapping_key = params
        .keyset
        .key_area_key(params.key_generation - 1, KaekIndex::Application)
        .ok_or_else(|| Error::MissingInput {
            name: format!(
                "key_area_key_application_{:02x}",
                params.key_generation - 1
            ),
        })?;

    // Section offsets come first: everything in the header depends on them.
    let mut offsets = Vec::with_capacity(sections.len());
    let mut cursor = NCA_HEADER_SIZE as u64;
    for section in &sections {
        offsets.push(cursor);
        cursor += section.padded_len();
    }
    let total_size = cursor;

    let mut envelope = vec![0u8; total_size as usize];
    for (section, &offset) in sections.iter().zip(&offsets) {
        envelope[offset as usize..offset as usize + section.data.len()]
            .copy_from_slice(&section.data);
    }

    // Main header fields (signed region 0x200..0x400).
    envelope[0x200..0x204].copy_from_slice(b"NCA3");
    envelope[0x204] = DistributionType::Download as u8;
    envelope[0x205] = params.content_type as u8;
    envelope[0x206] = if params.key_generation == 1 { 0 } else { 2 };
    envelope[0x207] = 0; // kaek index: application
    LittleEndian::write_u64(&mut envelope[0x208..], total_size);
    LittleEndian::write_u64(&mut envelope[0x210..], params.title_id);
    LittleEndian::write_u32(&mut envelope[0x21C..], params.sdk_version);
    envelope[0x220] = if params.key_generation > 2 {
        params.key_generation
    } else {
        0
    };

    // Section entry table at 0x240, one 0x10 entry per section.
    for (i, (section, &offset)) in sections.iter().zip(&offsets).enumerate() {
        let entry = &mut envelope[0x240 + i * 0x10..0x250 + i * 0x10];
        LittleEndian::write_u32(&mut entry[0x00..], (offset / MEDIA_UNIT) as u32);
        LittleEndian::write_u32(
            &mut entry[0x04..],
            ((offset + section.padded_len()) / MEDIA_UNIT) as u32,
        );
        entry[0x08] = 1;
    }

    // Fs headers at 0x400 + i·0x200, with crypt type and section counter
    // written before the header hashes are taken.
    for (i, section) in sections.iter().enumerate() {
        let base = 0x400 + i * 0x200;
        envelope[base..base + 0x200].copy_from_slice(&section.fs_header);
        envelope[base + 0x04] = if params.plaintext {
            EncryptionType::None as u8
        } else {
            section.encryption as u8
        };
        LittleEndian::write_u32(&mut envelope[base + 0x140..], i as u32);
    }

    for i in 0..sections.len() {
        let base = 0x400 + i * 0x200;
        let hash = sha256(&envelope[base..base + 0x200]);
        envelope[0x280 + i * 0x20..0x2A0 + i * 0x20].copy_from_slice(&hash);
    }

    // Plaintext content key in key-area slot 2.
    envelope[0x320..0x330].copy_from_slice(&params.key_area_key);

    if let Some(signer) = params.signer {
        let signature = signer.sign(&envelope[0x200..0x400])?;
        envelope[0x100..0x200].copy_from_slice(&signature);
    }

    // Section bodies: AES-CTR over the signed plaintext.
    if !params.plaintext {
        for (i, (section, &offset)) in sections.iter().zip(&offsets).enumerate() {
            if section.encryption != EncryptionType::AesCtr {
                continue;
            }
            let counter = section_counter(i as u32, offset);
            let end = (offset + section.padded_len()) as usize;
            aes_ctr_apply(
                &params.key_area_key,
                &counter,
                &mut envelope[offset as usize..end],
            );
        }
    }

    // Wrap the key area, then seal the header.
    aes_ecb_encrypt(wrapping_key, &mut envelope[0x300..0x340])?;
    aes_xts_encrypt(header_key, &mut envelope[..NCA_HEADER_SIZE], 0x200, 0)?;

    let hash = sha256(&envelope);
    let mut nca_id = [0u8; 0x10];
    nca_id.copy_from_slice(&hash[..0x10]);

    tracing::info!(
        content_type = ?params.content_type,
        nca_id = hex::encode(nca_id),
        size = total_size,
        "NCA assembled"
    );

    Ok(BuiltNca {
        bytes: envelope,
        hash,
        nca_id,
    })
}

/// Initial AES-CTR counter for a section: the section counter in the high
/// half (big-endian), the media offset in 16-byte units in the low half.
pub fn section_counter(section_ctr: u32, byte_offset: u64) -> [u8; 0x10] {
    let mut counter = [0u8; 0x10];
    counter[..8].copy_from_slice(&(section_ctr as u64).to_be_bytes());
    counter[8..].copy_from_slice(&(byte_offset / 16).to_be_bytes());
    counter
}

/// Decrypt the 0xC00 header region of a finished NCA; the inspection-side
/// inverse of the final assembly pass.
pub fn decrypt_header(nca: &[u8], keyset: &Keyset) -> Result<[u8; NCA_HEADER_SIZE]> {
    if nca.len() < NCA_HEADER_SIZE {
        return Err(Error::InvalidFieldRange {
            field: "NCA size",
            value: nca.len() as u64,
        });
    }
    let header_key = keyset.header_key().ok_or_else(|| Error::MissingInput {
        name: "header_key".to_string(),
    })?;
    let mut header = [0u8; NCA_HEADER_SIZE];
    header.copy_from_slice(&nca[..NCA_HEADER_SIZE]);
    aes_xts_decrypt(header_key, &mut header, 0x200, 0)?;
    if &header[0x200..0x204] != b"NCA3" {
        return Err(Error::InvalidMagic { location: "NCA3" });
    }
    Ok(header)
}
