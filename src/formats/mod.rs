pub mod cnmt;
pub mod hfs0;
pub mod ivfc;
pub mod keyset;
pub mod nacp;
pub mod nca;
pub mod ncz;
pub mod npdm;
pub mod pfs0;
pub mod romfs;
pub mod xci;

pub use keyset::Keyset;
