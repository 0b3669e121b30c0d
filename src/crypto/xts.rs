//! Software AES-128-XTS engine.
//!
//! Synthesizes XTS from the AES-128-ECB block primitive plus GF(2^128)
//! tweak doubling. The fast path in [`crate::crypto`] goes through the
//! `xts-mode` crate; this engine exists for callers whose AES backend has no
//! native XTS, and doubles as an independent reference the fast path is
//! tested against.
//!
//! The tweak encoding is Nintendo's variant: the sector number is written
//! big-endian into the 16-byte tweak block (byte 15 = least significant),
//! then encrypted with the second key half. Tweak advancement between blocks
//! is the standard IEEE 1619 doubling (byte 0 = least significant bit order,
//! reduction polynomial x^128 + x^7 + x^2 + x + 1).

use aes::Aes128;
use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};

use crate::error::{Error, Result};
use crate::io::get_nintendo_tweak;

/// Multiply the tweak by alpha in GF(2^128).
///
/// Byte-wise left shift towards higher indices; a carry out of byte 15 is
/// reduced by XORing 0x87 into byte 0.
pub(crate) fn gf128_double(t: &mut [u8; 16]) {
    let carry = t[15] >> 7;
    for i in (1..16).rev() {
        t[i] = (t[i] << 1) | (t[i - 1] >> 7);
    }
    t[0] <<= 1;
    if carry != 0 {
        t[0] ^= 0x87;
    }
}

/// Software XTS cipher over two AES-128 schedules.
pub struct XtsEngine {
    data_cipher: Aes128,
    tweak_cipher: Aes128,
}

impl XtsEngine {
    /// Split the 32-byte XTS key into the data half (first 16 bytes) and the
    /// tweak half (last 16 bytes).
    pub fn new(key: &[u8; 0x20]) -> Self {
        Self {
            data_cipher: Aes128::new(GenericArray::from_slice(&key[..0x10])),
            tweak_cipher: Aes128::new(GenericArray::from_slice(&key[0x10..])),
        }
    }

    fn check_args(data: &[u8], sector_size: usize) -> Result<()> {
        if sector_size == 0 || sector_size % 16 != 0 {
            return Err(Error::Misaligned {
                what: "XTS sector size",
            });
        }
        if data.len() % sector_size != 0 {
            return Err(Error::Misaligned { what: "XTS data" });
        }
        Ok(())
    }

    fn initial_tweak(&self, sector: u128) -> [u8; 16] {
        let mut tweak = get_nintendo_tweak(sector);
        self.tweak_cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut tweak));
        tweak
    }

    /// Encrypt `data` in place. The length must be a multiple of
    /// `sector_size`, which must itself be a multiple of 16.
    pub fn encrypt(&self, data: &mut [u8], sector_size: usize, first_sector: u128) -> Result<()> {
        Self::check_args(data, sector_size)?;
        for (i, sector) in data.chunks_exact_mut(sector_size).enumerate() {
            let mut tweak = self.initial_tweak(first_sector + i as u128);
            for block in sector.chunks_exact_mut(16) {
                xor_in_place(block, &tweak);
                self.data_cipher
                    .encrypt_block(GenericArray::from_mut_slice(block));
                xor_in_place(block, &tweak);
                gf128_double(&mut tweak);
            }
        }
        Ok(())
    }

    /// Decrypt `data` in place, symmetric to [`Self::encrypt`].
    pub fn decrypt(&self, data: &mut [u8], sector_size: usize, first_sector: u128) -> Result<()> {
        Self::check_args(data, sector_size)?;
        for (i, sector) in data.chunks_exact_mut(sector_size).enumerate() {
            let mut tweak = self.initial_tweak(first_sector + i as u128);
            for block in sector.chunks_exact_mut(16) {
                xor_in_place(block, &tweak);
                self.data_cipher
                    .decrypt_block(GenericArray::from_mut_slice(block));
                xor_in_place(block, &tweak);
                gf128_double(&mut tweak);
            }
        }
        Ok(())
    }
}

#[inline]
fn xor_in_place(block: &mut [u8], tweak: &[u8; 16]) {
    for (b, t) in block.iter_mut().zip(tweak.iter()) {
        *b ^= t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gf128_double_low_byte() {
        let mut t = [0u8; 16];
        t[0] = 0x01;
        gf128_double(&mut t);
        let mut expected = [0u8; 16];
        expected[0] = 0x02;
        assert_eq!(t, expected);
    }

    #[test]
    fn test_gf128_double_reduction() {
        let mut t = [0u8; 16];
        t[15] = 0x80;
        gf128_double(&mut t);
        let mut expected = [0u8; 16];
        expected[0] = 0x87;
        assert_eq!(t, expected);
    }

    #[test]
    fn test_gf128_double_carry_propagation() {
        let mut t = [0u8; 16];
        t[0] = 0x80;
        gf128_double(&mut t);
        let mut expected = [0u8; 16];
        expected[1] = 0x01;
        assert_eq!(t, expected);
    }

    #[test]
    fn test_round_trip() {
        let key = [0x5Au8; 0x20];
        let engine = XtsEngine::new(&key);
        let original: Vec<u8> = (0..0x400).map(|i| (i * 7) as u8).collect();

        let mut data = original.clone();
        engine.encrypt(&mut data, 0x200, 3).unwrap();
        assert_ne!(data, original);
        engine.decrypt(&mut data, 0x200, 3).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_rejects_misaligned_input() {
        let engine = XtsEngine::new(&[0u8; 0x20]);
        let mut short = vec![0u8; 0x1FF];
        assert!(matches!(
            engine.encrypt(&mut short, 0x200, 0),
            Err(Error::Misaligned { .. })
        ));
        let mut data = vec![0u8; 0x200];
        assert!(matches!(
            engine.encrypt(&mut data, 0x88, 0),
            Err(Error::Misaligned { .. })
        ));
    }

    #[test]
    fn test_sector_independence() {
        // Encrypting two sectors at once must equal encrypting them one at a
        // time with advancing start sectors.
        let key = [0x11u8; 0x20];
        let engine = XtsEngine::new(&key);
        let original: Vec<u8> = (0..0x400).map(|i| i as u8).collect();

        let mut combined = original.clone();
        engine.encrypt(&mut combined, 0x200, 5).unwrap();

        let mut first = original[..0x200].to_vec();
        let mut second = original[0x200..].to_vec();
        engine.encrypt(&mut first, 0x200, 5).unwrap();
        engine.encrypt(&mut second, 0x200, 6).unwrap();

        assert_eq!(&combined[..0x200], &first[..]);
        assert_eq!(&combined[0x200..], &second[..]);
    }
}
