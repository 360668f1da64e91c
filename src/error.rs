use crate::allocator::BlockRun;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Block run out of range: {0}")]
    OutOfRange(BlockRun),

    #[error("Insufficient space: blocks {start}..{end} in group {group} are not all free")]
    InsufficientSpace { group: u32, start: u32, end: u32 },

    #[error("Device full: no group has a free run of {minimum} blocks (requested {requested})")]
    DeviceFull { requested: u32, minimum: u32 },

    #[error("Double free: block {block} of group {group} is already free")]
    DoubleFree { group: u32, block: u32 },

    #[error("Cross-linked blocks: {count} block(s) claimed twice, first at block {block}")]
    CrossLinkedBlocks { block: u64, count: u64 },

    #[error("Corrupt volume geometry: {0}")]
    CorruptGeometry(String),

    #[error("I/O error on block {block:?}: {source}")]
    Io {
        block: Option<u64>,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid magic number in superblock")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("Superblock checksum verification failed")]
    ChecksumMismatch,

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Package already active: {0}")]
    PackageAlreadyActive(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Invalid package path: {0}")]
    InvalidPath(String),
}

impl AllocError {
    /// Wrap an I/O error that happened while touching a specific block
    pub fn io_at(block: u64, source: std::io::Error) -> Self {
        AllocError::Io {
            block: Some(block),
            source,
        }
    }

    /// Structural corruption that must not be ignored by the caller chain
    ///
    /// Callers are expected to force a consistency check or remount
    /// read-only when they see one of these.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            AllocError::DoubleFree { .. } | AllocError::CrossLinkedBlocks { .. }
        )
    }

    /// Out of space, as opposed to a caller bug or corruption
    pub fn is_no_space(&self) -> bool {
        matches!(
            self,
            AllocError::DeviceFull { .. } | AllocError::InsufficientSpace { .. }
        )
    }
}

impl From<std::io::Error> for AllocError {
    fn from(source: std::io::Error) -> Self {
        AllocError::Io {
            block: None,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;
