use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("cannot decode cycle from file name: {0}")]
    ParseCycle(String),
    #[error("cycle {0} cannot be resolved to a segment")]
    UnresolvedCycle(u32),
    #[error("directory lock not acquired within {0:?}")]
    LockTimeout(std::time::Duration),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("segment full")]
    SegmentFull,
}

pub type Result<T> = std::result::Result<T, Error>;
