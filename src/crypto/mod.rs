//! Cryptographic primitives used by the NCA pipeline.
//!
//! Thin adapters over the RustCrypto stack: AES-128 in ECB/CTR/XTS modes,
//! SHA-256, and RSA-2048-PSS signing. All multi-block operations work on
//! whole buffers in place; misaligned input is rejected rather than padded.
//!
//! The XTS fast path uses the `xts-mode` crate with Nintendo's big-endian
//! sector tweak. [`xts::XtsEngine`] provides the same transform built from
//! the bare ECB primitive for backends without native XTS.

pub mod xts;

use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{
    generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
    StreamCipher,
};
use rand::rngs::OsRng;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use xts_mode::Xts128;

use crate::error::{Error, Result};
use crate::io::get_nintendo_tweak;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES-128-ECB encrypt `data` in place. Length must be a multiple of 16.
pub fn aes_ecb_encrypt(key: &[u8; 0x10], data: &mut [u8]) -> Result<()> {
    if data.len() % 16 != 0 {
        return Err(Error::Misaligned {
            what: "AES-ECB data",
        });
    }
    let len = data.len();
    Aes128EcbEnc::new(key.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| Error::CryptoBackend {
            operation: "AES-ECB encrypt",
        })?;
    Ok(())
}

/// AES-128-ECB decrypt `data` in place. Length must be a multiple of 16.
pub fn aes_ecb_decrypt(key: &[u8; 0x10], data: &mut [u8]) -> Result<()> {
    if data.len() % 16 != 0 {
        return Err(Error::Misaligned {
            what: "AES-ECB data",
        });
    }
    Aes128EcbDec::new(key.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::CryptoBackend {
            operation: "AES-ECB decrypt",
        })?;
    Ok(())
}

/// Derive a 16-byte key the Nintendo way: ECB-decrypt `source` with `key`.
pub fn derive_key(key: &[u8; 0x10], source: &[u8; 0x10]) -> Result<[u8; 0x10]> {
    let mut out = *source;
    aes_ecb_decrypt(key, &mut out)?;
    Ok(out)
}

/// AES-128-CTR keystream application. Encryption and decryption are the same
/// operation; the counter auto-increments big-endian across blocks.
pub fn aes_ctr_apply(key: &[u8; 0x10], counter: &[u8; 0x10], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), counter.into());
    cipher.apply_keystream(data);
}

/// AES-128-XTS encrypt with the Nintendo big-endian sector tweak.
///
/// `data` must be a whole number of sectors; `sector_size` a multiple of 16.
pub fn aes_xts_encrypt(
    key: &[u8; 0x20],
    data: &mut [u8],
    sector_size: usize,
    first_sector: u128,
) -> Result<()> {
    check_xts_args(data, sector_size)?;
    header_xts(key).encrypt_area(data, sector_size, first_sector, get_nintendo_tweak);
    Ok(())
}

/// AES-128-XTS decrypt, symmetric to [`aes_xts_encrypt`].
pub fn aes_xts_decrypt(
    key: &[u8; 0x20],
    data: &mut [u8],
    sector_size: usize,
    first_sector: u128,
) -> Result<()> {
    check_xts_args(data, sector_size)?;
    header_xts(key).decrypt_area(data, sector_size, first_sector, get_nintendo_tweak);
    Ok(())
}

fn check_xts_args(data: &[u8], sector_size: usize) -> Result<()> {
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

fn header_xts(key: &[u8; 0x20]) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(&key[..0x10]));
    let cipher_2 = Aes128::new(GenericArray::from_slice(&key[0x10..]));
    Xts128::new(cipher_1, cipher_2)
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 0x20] {
    let mut out = [0u8; 0x20];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// RSA-2048-PSS signer for NCA headers and the ACID public-key patch.
///
/// A fresh keypair is generated per build session; the public modulus exposed
/// here is the one that gets written into the ACID so the signature chain
/// stays self-consistent within one package.
pub struct NcaSigner {
    signing_key: SigningKey<Sha256>,
    modulus: [u8; 0x100],
}

impl NcaSigner {
    /// Generate a new RSA-2048 keypair. This takes a noticeable fraction of a
    /// second; build sessions create one signer and reuse it for every NCA.
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).map_err(|_| Error::CryptoBackend {
            operation: "RSA keygen",
        })?;

        let n = private_key.n().to_bytes_be();
        if n.len() > 0x100 {
            return Err(Error::CryptoBackend {
                operation: "RSA keygen",
            });
        }
        let mut modulus = [0u8; 0x100];
        modulus[0x100 - n.len()..].copy_from_slice(&n);

        tracing::debug!("generated session RSA-2048 signing key");

        Ok(Self {
            signing_key: SigningKey::new(private_key),
            modulus,
        })
    }

    /// Sign `message` with RSA-PSS over SHA-256, salt length 32.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 0x100]> {
        let signature = self.signing_key.sign_with_rng(&mut OsRng, message);
        let bytes = signature.to_bytes();
        let mut out = [0u8; 0x100];
        if bytes.len() != 0x100 {
            return Err(Error::CryptoBackend {
                operation: "RSA-PSS sign",
            });
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// The 256-byte public modulus matching this signer's private key.
    pub fn modulus(&self) -> &[u8; 0x100] {
        &self.modulus
    }
}
