//! Error types.

use std::io;
use std::num::ParseIntError;
use std::string::FromUtf8Error;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_: FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(String),

    #[error("unknown event type: {0:#010x}")]
    UnknownEventType(u32),
    #[error("event type {mnemonic} ({id:#010x}) already registered")]
    DuplicateEventType { id: u32, mnemonic: String },
    #[error("stream truncated at byte {0}")]
    Truncated(u64),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("packet nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("write protected: {0}")]
    WriteProtected(String),
    #[error("read failure: {0}")]
    ReadFailure(String),

    #[cfg(feature = "lz4")]
    #[error("failed decompressing record: {0}")]
    DecompressionError(String),

    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("unknown stream: {0}")]
    UnknownStream(u32),
    #[error("stream already registered: {0}")]
    StreamExists(u32),
    #[error("no run started")]
    NoRunStarted,

    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    /// Maps an io error from creating `path` for writing onto the file error
    /// variants.
    pub fn from_create_at(e: io::Error, path: &str) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_string()),
            io::ErrorKind::PermissionDenied => Error::WriteProtected(path.to_string()),
            _ => Error::IoError(format!("{}: {}", path, e)),
        }
    }
}
