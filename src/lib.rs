//! **nx-forge** - construct Nintendo Switch content archives and unpack
//! their containers.
//!
//! # What's here
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`formats::keyset`] | Keyfile parsing + master-key derivation chain |
//! | [`formats::pfs0`]   | PFS0 / NSP flat archives (read + write) |
//! | [`formats::romfs`]  | RomFS images (read + write) |
//! | [`formats::ivfc`]   | IVFC hash trees for RomFS sections |
//! | [`formats::cnmt`]   | Content metadata records (read + write) |
//! | [`formats::npdm`]   | META/ACI0/ACID title-id and key patching |
//! | [`formats::nacp`]   | Control property patching |
//! | [`formats::nca`]    | NCA3 assembly (hashing, signing, encryption) |
//! | [`formats::hfs0`]   | Hashed filesystem partitions (XCI) |
//! | [`formats::xci`]    | Game card image locator |
//! | [`formats::ncz`]    | Compressed NCA streaming decoder |
//! | [`nsp`]             | End-to-end NSP package builds |
//! | [`crypto`]          | AES-ECB/CTR/XTS, SHA-256, RSA-PSS primitives |

pub mod crypto;
pub mod error;
pub mod formats;
pub mod io;
pub mod nsp;

pub use error::{Error, Result};
pub use formats::Keyset;
pub use nsp::{build_nsp, KeyInput, NspBuild, NspBuildOptions};
