use thiserror::Error;

/// Result alias used throughout nx-forge.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Validation failures carry the location or field that failed so callers can
/// tell which artifact was malformed without re-parsing anything.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid magic in {location}")]
    InvalidMagic { location: &'static str },
    #[error("{field} out of range: {value:#x}")]
    InvalidFieldRange { field: &'static str, value: u64 },
    #[error("{what} is misaligned")]
    Misaligned { what: &'static str },
    #[error("missing required input: {name}")]
    MissingInput { name: String },
    #[error("crypto backend failure during {operation}")]
    CryptoBackend { operation: &'static str },
    #[error("zstd failure during {phase}: {message}")]
    Zstd {
        phase: &'static str,
        message: String,
    },
    #[error("no NCZ section covers offset {offset:#x}")]
    NoSectionForOffset { offset: u64 },
    #[error("sink rejected write: {0}")]
    SinkWrite(std::io::Error),
    /// Caller-requested abort surfaced through a backend or sink.
    #[error("operation cancelled")]
    Cancelled,
    #[error("binary parse error: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
