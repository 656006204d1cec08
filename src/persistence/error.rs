//! Persistence error types.

use std::fmt;

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    /// The fjall keyspace refused an operation
    Storage(fjall::Error),
    /// A record could not be encoded for storage
    Encode(bincode::error::EncodeError),
    /// A stored record no longer decodes
    Decode {
        partition: &'static str,
        key: String,
        source: bincode::error::DecodeError,
    },
    /// A stored key is not a valid topic or client identifier
    InvalidKey { partition: &'static str },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Encode(e) => write!(f, "failed to encode record: {}", e),
            Self::Decode {
                partition,
                key,
                source,
            } => write!(f, "undecodable record {}/{}: {}", partition, key, source),
            Self::InvalidKey { partition } => write!(f, "non-UTF-8 key in {}", partition),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode { source, .. } => Some(source),
            Self::InvalidKey { .. } => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
