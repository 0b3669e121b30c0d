//! Field enums for the NCA3 header and its per-section fs headers.

/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

/// The type of content stored in the NCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, NACP).
    Control = 0x02,
    /// Manual content (HtmlDocument and LegalInformation sections).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

/// Filesystem type of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsType {
    /// RomFS filesystem
    RomFs = 0x00,
    /// Partition filesystem
    PartitionFs = 0x01,
}

/// Hash type used for filesystem verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashType {
    Auto = 0x00,
    None = 0x01,
    /// Hierarchical SHA256 hash (PFS0 sections)
    HierarchicalSha256Hash = 0x02,
    /// Hierarchical integrity hash (RomFS sections, IVFC)
    HierarchicalIntegrityHash = 0x03,
}

/// Encryption type for NCA section content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionType {
    Auto = 0x00,
    /// No encryption
    None = 0x01,
    /// AES-XTS encryption
    AesXts = 0x02,
    /// AES-CTR encryption
    AesCtr = 0x03,
    /// AES-CTR extended encryption
    AesCtrEx = 0x04,
}
