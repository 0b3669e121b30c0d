//! NPDM (META/ACI0/ACID) process metadata: title-id extraction and the
//! ACID public-modulus patch.
//!
//! Only the fields the build pipeline needs are touched. The META header
//! carries offsets to the ACI0 (per-title access control, holding the title
//! id) and the ACID (the RSA-signed descriptor whose embedded public key we
//! replace with the session signing key's modulus).
//!
//! ```text
//! META + 0x70  ACI0 offset (u32 LE)
//! META + 0x78  ACID offset (u32 LE)
//! ACI0 + 0x10  title id (u64 LE)
//! ACID + 0x100..0x200  public key modulus
//! ACID + 0x200 "ACID" magic
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Lowest valid application title id.
pub const TITLE_ID_MIN: u64 = 0x0100000000000000;
/// Highest valid application title id.
pub const TITLE_ID_MAX: u64 = 0x0FFFFFFFFFFFFFFF;

/// Offsets into an NPDM blob resolved by [`parse_npdm`].
#[derive(Debug, Clone, Copy)]
pub struct Npdm {
    /// Effective title id (after any override was applied).
    pub title_id: u64,
    aci0_offset: usize,
    acid_offset: usize,
}

impl Npdm {
    /// Byte offset of the title id field.
    fn title_id_offset(&self) -> usize {
        self.aci0_offset + 0x10
    }

    /// Byte range of the ACID public modulus.
    fn acid_modulus_range(&self) -> std::ops::Range<usize> {
        self.acid_offset + 0x100..self.acid_offset + 0x200
    }
}

/// Validate the META/ACI0/ACID structure and read the title id.
pub fn parse_npdm(data: &[u8]) -> Result<Npdm> {
    check_magic(data, 0, b"META", "NPDM META")?;

    let aci0_offset = read_u32(data, 0x70, "NPDM ACI0 offset")? as usize;
    let acid_offset = read_u32(data, 0x78, "NPDM ACID offset")? as usize;

    check_magic(data, aci0_offset, b"ACI0", "NPDM ACI0")?;
    check_magic(data, acid_offset + 0x200, b"ACID", "NPDM ACID")?;

    let title_id_offset = aci0_offset + 0x10;
    if title_id_offset + 8 > data.len() {
        return Err(Error::InvalidFieldRange {
            field: "NPDM ACI0 offset",
            value: aci0_offset as u64,
        });
    }
    if acid_offset + 0x204 > data.len() {
        return Err(Error::InvalidFieldRange {
            field: "NPDM ACID offset",
            value: acid_offset as u64,
        });
    }

    Ok(Npdm {
        title_id: LittleEndian::read_u64(&data[title_id_offset..]),
        aci0_offset,
        acid_offset,
    })
}

/// Parse, optionally override the title id in place, range-check it, and
/// optionally patch the ACID public modulus. Returns the resolved metadata
/// with the effective title id.
pub fn patch_npdm(
    data: &mut [u8],
    title_id_override: Option<u64>,
    acid_modulus: Option<&[u8; 0x100]>,
) -> Result<Npdm> {
    let mut npdm = parse_npdm(data)?;

    if let Some(title_id) = title_id_override {
        LittleEndian::write_u64(&mut data[npdm.title_id_offset()..], title_id);
        npdm.title_id = title_id;
    }

    if !(TITLE_ID_MIN..=TITLE_ID_MAX).contains(&npdm.title_id) {
        return Err(Error::InvalidFieldRange {
            field: "NPDM title id",
            value: npdm.title_id,
        });
    }

    if let Some(modulus) = acid_modulus {
        data[npdm.acid_modulus_range()].copy_from_slice(modulus);
        tracing::debug!("ACID public modulus patched");
    }

    tracing::debug!(title_id = format!("{:016x}", npdm.title_id), "NPDM processed");
    Ok(npdm)
}

fn check_magic(data: &[u8], offset: usize, magic: &[u8; 4], location: &'static str) -> Result<()> {
    if data.len() < offset + 4 || &data[offset..offset + 4] != magic {
        return Err(Error::InvalidMagic { location });
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize, field: &'static str) -> Result<u32> {
    if data.len() < offset + 4 {
        return Err(Error::InvalidFieldRange {
            field,
            value: offset as u64,
        });
    }
    Ok(LittleEndian::read_u32(&data[offset..]))
}

#[cfg(test)]
pub(crate) fn build_test_npdm(title_id: u64) -> Vec<u8> {
    // Minimal META with ACI0 at 0x80 and ACID at 0x100.
    let mut data = vec![0u8; 0x400];
    data[0..4].copy_from_slice(b"META");
    LittleEndian::write_u32(&mut data[0x70..], 0x80);
    LittleEndian::write_u32(&mut data[0x78..], 0x100);
    data[0x80..0x84].copy_from_slice(b"ACI0");
    LittleEndian::write_u64(&mut data[0x90..], title_id);
    data[0x300..0x304].copy_from_slice(b"ACID");
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_title_id() {
        let data = build_test_npdm(0x0100000000001000);
        let npdm = parse_npdm(&data).unwrap();
        assert_eq!(npdm.title_id, 0x0100000000001000);
    }

    #[test]
    fn test_title_id_below_range_fails() {
        let mut data = build_test_npdm(0x0000000000001000);
        assert!(matches!(
            patch_npdm(&mut data, None, None),
            Err(Error::InvalidFieldRange {
                field: "NPDM title id",
                ..
            })
        ));
    }

    #[test]
    fn test_title_id_above_range_fails() {
        let mut data = build_test_npdm(0x1000000000000000);
        assert!(patch_npdm(&mut data, None, None).is_err());
    }

    #[test]
    fn test_override_written_in_place() {
        let mut data = build_test_npdm(0x0100000000001000);
        let npdm = patch_npdm(&mut data, Some(0x0100AABBCCDD0000), None).unwrap();
        assert_eq!(npdm.title_id, 0x0100AABBCCDD0000);
        assert_eq!(
            LittleEndian::read_u64(&data[0x90..]),
            0x0100AABBCCDD0000
        );
    }

    #[test]
    fn test_override_is_range_checked() {
        let mut data = build_test_npdm(0x0100000000001000);
        assert!(patch_npdm(&mut data, Some(0x42), None).is_err());
    }

    #[test]
    fn test_acid_modulus_patch() {
        let mut data = build_test_npdm(0x0100000000001000);
        let modulus = [0x5Au8; 0x100];
        patch_npdm(&mut data, None, Some(&modulus)).unwrap();
        assert_eq!(&data[0x200..0x300], &modulus);
        // Magic untouched.
        assert_eq!(&data[0x300..0x304], b"ACID");
    }

    #[test]
    fn test_bad_magics() {
        let mut data = build_test_npdm(0x0100000000001000);
        data[0] = b'X';
        assert!(matches!(
            parse_npdm(&data),
            Err(Error::InvalidMagic {
                location: "NPDM META"
            })
        ));

        let mut data = build_test_npdm(0x0100000000001000);
        data[0x80] = b'X';
        assert!(matches!(
            parse_npdm(&data),
            Err(Error::InvalidMagic {
                location: "NPDM ACI0"
            })
        ));

        let mut data = build_test_npdm(0x0100000000001000);
        data[0x300] = b'X';
        assert!(matches!(
            parse_npdm(&data),
            Err(Error::InvalidMagic {
                location: "NPDM ACID"
            })
        ));
    }
}
