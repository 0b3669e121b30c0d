//! Nintendo Switch key material: keyfile parsing and the master-key
//! derivation chain.
//!
//! A keyfile is a `name = hex` text file (one entry per line, `#`/`;`
//! comments). From the seed values in that file the full hierarchy is
//! derived bottom-up:
//!
//! ```text
//! secure_boot_key + tsec_key + keyblob_key_source_XX
//!   └── keyblob_key_XX ── AES-CTR ──> keyblob_XX (0x90 bytes)
//!         └── master_kek_00..05  (keyblob bytes 0x00..0x10)
//! tsec_root_kek + tsec_auth_signature_XX
//!   └── tsec_root_key_XX ──> master_kek_06..1F
//! master_kek_XX + master_key_source ──> master_key_XX
//! master_key_XX + kaek sources      ──> key_area_key_{application,ocean,system}_XX
//! master_key_00 + header sources    ──> header_key (32 bytes, AES-XTS)
//! ```
//!
//! Values already present in the keyfile win; derivation only fills what is
//! absent. Entries are fixed-size flat arrays where all-zero means "absent".

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::crypto::{aes_ctr_apply, aes_ecb_decrypt, aes_ecb_encrypt, derive_key};
use crate::error::{Error, Result};

/// Highest key generation understood by this library.
pub const MAX_KEY_GENERATION: usize = 0x20;

/// Number of keyblob slots (generations 1.0.0 through 6.1.0).
const KEYBLOB_COUNT: usize = 6;

/// Selects which key-area encryption key chain an NCA uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KaekIndex {
    /// Application content (games).
    Application = 0,
    /// Ocean content (game-card specific).
    Ocean = 1,
    /// System content (OS modules).
    System = 2,
}

impl KaekIndex {
    const SOURCES: [(KaekIndex, &'static str); 3] = [
        (KaekIndex::Application, "key_area_key_application_source"),
        (KaekIndex::Ocean, "key_area_key_ocean_source"),
        (KaekIndex::System, "key_area_key_system_source"),
    ];

    const NAMES: [&'static str; 3] = [
        "key_area_key_application",
        "key_area_key_ocean",
        "key_area_key_system",
    ];
}

/// The derived key surface for one build session.
///
/// Immutable once derivation has run; safe to share between pipelines.
#[derive(Clone)]
pub struct Keyset {
    /// Every entry of the keyfile, by lowercased name.
    raw_keys: HashMap<String, Vec<u8>>,

    header_key: [u8; 0x20],
    key_area_keys: [[[u8; 0x10]; 3]; MAX_KEY_GENERATION],

    // Intermediates, kept so callers can inspect how far derivation got.
    keyblob_keys: [[u8; 0x10]; KEYBLOB_COUNT],
    keyblob_mac_keys: [[u8; 0x10]; KEYBLOB_COUNT],
    keyblobs: [[u8; 0x90]; KEYBLOB_COUNT],
    package1_keys: [[u8; 0x10]; KEYBLOB_COUNT],
    tsec_root_keys: [[u8; 0x10]; MAX_KEY_GENERATION - KEYBLOB_COUNT],
    master_keks: [[u8; 0x10]; MAX_KEY_GENERATION],
    master_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
}

impl Default for Keyset {
    fn default() -> Self {
        Self {
            raw_keys: HashMap::new(),
            header_key: [0; 0x20],
            key_area_keys: [[[0; 0x10]; 3]; MAX_KEY_GENERATION],
            keyblob_keys: [[0; 0x10]; KEYBLOB_COUNT],
            keyblob_mac_keys: [[0; 0x10]; KEYBLOB_COUNT],
            keyblobs: [[0; 0x90]; KEYBLOB_COUNT],
            package1_keys: [[0; 0x10]; KEYBLOB_COUNT],
            tsec_root_keys: [[0; 0x10]; MAX_KEY_GENERATION - KEYBLOB_COUNT],
            master_keks: [[0; 0x10]; MAX_KEY_GENERATION],
            master_keys: [[0; 0x10]; MAX_KEY_GENERATION],
        }
    }
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let populated: Vec<usize> = (0..MAX_KEY_GENERATION)
            .filter(|&i| present(&self.master_keys[i]))
            .collect();
        f.debug_struct("Keyset")
            .field("raw_entries", &self.raw_keys.len())
            .field("has_header_key", &present(&self.header_key))
            .field("master_key_generations", &populated)
            .finish()
    }
}

fn present(key: &[u8]) -> bool {
    key.iter().any(|&b| b != 0)
}

impl Keyset {
    /// Parse a keyfile and run the full derivation chain.
    pub fn from_text(text: &str) -> Result<Self> {
        Self::from_text_inner(text, None)
    }

    /// Parse a keyfile, deriving only generation `generation` (plus
    /// generation 0, which the header key depends on). The output for the
    /// requested generation is identical to [`Self::from_text`].
    pub fn from_text_for_generation(text: &str, generation: u8) -> Result<Self> {
        Self::from_text_inner(text, Some(generation as usize))
    }

    /// Parse a keyfile from a reader.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::from_text(&text)
    }

    /// Parse a keyfile from a path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    fn from_text_inner(text: &str, target: Option<usize>) -> Result<Self> {
        let mut keyset = Keyset {
            raw_keys: parse_key_lines(text)?,
            ..Default::default()
        };
        keyset.load_direct_keys();
        keyset.derive_keys(target);

        tracing::info!(
            entries = keyset.raw_keys.len(),
            header_key = present(&keyset.header_key),
            "keyset loaded"
        );
        Ok(keyset)
    }

    /// Look up a raw keyfile entry by its exact (lowercased) name.
    pub fn get_raw_key(&self, name: &str) -> Option<&[u8]> {
        self.raw_keys.get(name).map(|v| v.as_slice())
    }

    /// The 32-byte AES-XTS NCA header key, or `None` if it could not be
    /// loaded or derived.
    pub fn header_key(&self) -> Option<&[u8; 0x20]> {
        present(&self.header_key).then_some(&self.header_key)
    }

    /// Key-area encryption key for `generation` (0-based) and `index`.
    pub fn key_area_key(&self, generation: u8, index: KaekIndex) -> Option<&[u8; 0x10]> {
        let key = self
            .key_area_keys
            .get(generation as usize)?
            .get(index as usize)?;
        present(key).then_some(key)
    }

    /// Master key for `generation`, mainly useful for diagnostics and tests.
    pub fn master_key(&self, generation: u8) -> Option<&[u8; 0x10]> {
        let key = self.master_keys.get(generation as usize)?;
        present(key).then_some(key)
    }

    /// Package1 key extracted from keyblob `index`.
    pub fn package1_key(&self, index: usize) -> Option<&[u8; 0x10]> {
        let key = self.package1_keys.get(index)?;
        present(key).then_some(key)
    }

    fn key_n<const N: usize>(&self, name: &str) -> Option<[u8; N]> {
        let data = self.raw_keys.get(name)?;
        (data.len() == N).then(|| {
            let mut out = [0u8; N];
            out.copy_from_slice(data);
            out
        })
    }

    fn key_indexed<const N: usize>(&self, prefix: &str, idx: usize) -> Option<[u8; N]> {
        self.key_n(&format!("{prefix}_{idx:02x}"))
    }

    /// Copy keys the file provides pre-derived. File values always win over
    /// derivation.
    fn load_direct_keys(&mut self) {
        if let Some(key) = self.key_n::<0x20>("header_key") {
            self.header_key = key;
        }
        for i in 0..MAX_KEY_GENERATION {
            if let Some(key) = self.key_indexed::<0x10>("master_key", i) {
                self.master_keys[i] = key;
            }
            for (index, _) in KaekIndex::SOURCES {
                if let Some(key) = self.key_indexed::<0x10>(KaekIndex::NAMES[index as usize], i) {
                    self.key_area_keys[i][index as usize] = key;
                }
            }
        }
    }

    /// Run the derivation chain bottom-up. Missing inputs leave their
    /// outputs zeroed; nothing fails.
    ///
    /// With `target = Some(g)` only generations `g` and 0 are derived (the
    /// header key hangs off master key 0). The values produced for `g` are
    /// unchanged by the skipping.
    fn derive_keys(&mut self, target: Option<usize>) {
        let wanted = |i: usize| target.map_or(true, |t| i == t || i == 0);

        self.derive_keyblobs(&wanted);
        self.derive_tsec_chain(&wanted);
        self.derive_master_keys(&wanted);
        self.derive_key_area_keys(&wanted);
        self.derive_header_key();
    }

    fn derive_keyblobs(&mut self, wanted: &dyn Fn(usize) -> bool) {
        let secure_boot_key = self.key_n::<0x10>("secure_boot_key");
        let tsec_key = self.key_n::<0x10>("tsec_key");
        let mac_source = self.key_n::<0x10>("keyblob_mac_key_source");

        for i in 0..KEYBLOB_COUNT {
            if !wanted(i) {
                continue;
            }
            if let (Some(sbk), Some(tsec), Some(source)) = (
                secure_boot_key,
                tsec_key,
                self.key_indexed::<0x10>("keyblob_key_source", i),
            ) {
                // keyblob_key = ECB-dec(sbk, ECB-dec(tsec, source))
                if let Ok(inner) = derive_key(&tsec, &source) {
                    if let Ok(key) = derive_key(&sbk, &inner) {
                        self.keyblob_keys[i] = key;
                    }
                }
            }

            if present(&self.keyblob_keys[i]) {
                if let Some(mac_source) = mac_source {
                    if let Ok(mac) = derive_key(&self.keyblob_keys[i], &mac_source) {
                        self.keyblob_mac_keys[i] = mac;
                    }
                }
                if let Some(encrypted) = self.key_indexed::<0xB0>("encrypted_keyblob", i) {
                    // Layout: CMAC (0x10) | CTR (0x10) | payload (0x90).
                    let mut counter = [0u8; 0x10];
                    counter.copy_from_slice(&encrypted[0x10..0x20]);
                    let mut payload = [0u8; 0x90];
                    payload.copy_from_slice(&encrypted[0x20..]);
                    aes_ctr_apply(&self.keyblob_keys[i], &counter, &mut payload);
                    self.keyblobs[i] = payload;
                }
            }

            if present(&self.keyblobs[i]) {
                self.package1_keys[i].copy_from_slice(&self.keyblobs[i][0x80..0x90]);
                if !present(&self.master_keks[i]) {
                    let keyblob_head: [u8; 0x10] = self.keyblobs[i][0x00..0x10].try_into().unwrap();
                    self.master_keks[i] = keyblob_head;
                }
            }
        }

        // File-provided master keks shadow the keyblob-extracted ones.
        for i in 0..MAX_KEY_GENERATION {
            if let Some(kek) = self.key_indexed::<0x10>("master_kek", i) {
                self.master_keks[i] = kek;
            }
        }
    }

    fn derive_tsec_chain(&mut self, wanted: &dyn Fn(usize) -> bool) {
        let tsec_root_kek = self.key_n::<0x10>("tsec_root_kek");

        for i in KEYBLOB_COUNT..MAX_KEY_GENERATION {
            if !wanted(i) {
                continue;
            }
            let slot = i - KEYBLOB_COUNT;
            if let Some(root_key) = self.key_indexed::<0x10>("tsec_root_key", slot) {
                self.tsec_root_keys[slot] = root_key;
            } else if let (Some(kek), Some(signature)) = (
                tsec_root_kek,
                self.key_indexed::<0x10>("tsec_auth_signature", slot),
            ) {
                // tsec root keys come out of an ECB *encryption*.
                let mut key = signature;
                if aes_ecb_encrypt(&kek, &mut key).is_ok() {
                    self.tsec_root_keys[slot] = key;
                }
            }

            if !present(&self.master_keks[i]) && present(&self.tsec_root_keys[slot]) {
                if let Some(source) = self.key_indexed::<0x10>("master_kek_source", i) {
                    if let Ok(kek) = derive_key(&self.tsec_root_keys[slot], &source) {
                        self.master_keks[i] = kek;
                    }
                }
            }
        }
    }

    fn derive_master_keys(&mut self, wanted: &dyn Fn(usize) -> bool) {
        let Some(master_key_source) = self.key_n::<0x10>("master_key_source") else {
            return;
        };
        for i in 0..MAX_KEY_GENERATION {
            if !wanted(i) || present(&self.master_keys[i]) || !present(&self.master_keks[i]) {
                continue;
            }
            if let Ok(key) = derive_key(&self.master_keks[i], &master_key_source) {
                self.master_keys[i] = key;
            }
        }
    }

    /// `kek = ECB-dec(ECB-dec(master, kek_generation_source), source)`,
    /// `key = ECB-dec(kek, key_generation_source)`.
    fn generate_kek(&self, master_key: &[u8; 0x10], source: &[u8; 0x10]) -> Option<[u8; 0x10]> {
        let kek_generation_source = self.key_n::<0x10>("aes_kek_generation_source")?;
        let key_generation_source = self.key_n::<0x10>("aes_key_generation_source")?;

        let kek = derive_key(master_key, &kek_generation_source).ok()?;
        let src_kek = derive_key(&kek, source).ok()?;
        derive_key(&src_kek, &key_generation_source).ok()
    }

    fn derive_key_area_keys(&mut self, wanted: &dyn Fn(usize) -> bool) {
        for i in 0..MAX_KEY_GENERATION {
            if !wanted(i) || !present(&self.master_keys[i]) {
                continue;
            }
            let master_key = self.master_keys[i];
            for (index, source_name) in KaekIndex::SOURCES {
                if present(&self.key_area_keys[i][index as usize]) {
                    continue;
                }
                if let Some(source) = self.key_n::<0x10>(source_name) {
                    if let Some(key) = self.generate_kek(&master_key, &source) {
                        self.key_area_keys[i][index as usize] = key;
                    }
                }
            }
        }
    }

    fn derive_header_key(&mut self) {
        if present(&self.header_key) || !present(&self.master_keys[0]) {
            return;
        }
        let (Some(kek_source), Some(key_source)) = (
            self.key_n::<0x10>("header_kek_source"),
            self.key_n::<0x20>("header_key_source"),
        ) else {
            return;
        };
        let master_key = self.master_keys[0];
        if let Some(header_kek) = self.generate_kek(&master_key, &kek_source) {
            // ECB decrypts each 16-byte half of the 32-byte source.
            let mut header_key = key_source;
            if aes_ecb_decrypt(&header_kek, &mut header_key).is_ok() {
                self.header_key = header_key;
            }
        }
    }
}

/// Parse `name = hex` lines. Names are case-insensitive; `#` and `;` start
/// comments, including trailing ones. A non-hex or odd-length value fails
/// the whole parse.
fn parse_key_lines(text: &str) -> Result<HashMap<String, Vec<u8>>> {
    let mut keys = HashMap::new();

    for line in text.lines() {
        let line = line
            .split(|c| c == '#' || c == ';')
            .next()
            .unwrap_or("")
            .trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        let data = hex::decode(value).map_err(|_| Error::InvalidFieldRange {
            field: "keyfile hex value",
            value: 0,
        })?;
        keys.insert(name, data);
    }

    Ok(keys)
}
