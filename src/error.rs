use crate::serde::{DeserializeError, SerializeError};
use lz4_flex::block::DecompressError;

/// Why a compaction was stopped before completing
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The engine is shutting down
    Shutdown,

    /// A manual compaction was paused or canceled
    ManualPause,

    /// The owning keyspace is being closed or dropped
    Closed,
}

/// Represents errors that can occur during compaction
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Serialize(SerializeError),

    /// Deserialization failed
    Deserialize(DeserializeError),

    /// Decompression failed
    Decompress(DecompressError),

    /// On-disk data or an in-flight key stream failed an integrity check
    Corruption(String),

    /// A requested feature combination is not supported
    NotSupported(String),

    /// Malformed bounds, non-ascending inputs or API misuse
    InvalidArgument(String),

    /// The job observed a cancellation signal and stopped cooperatively
    Stopped(StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactionError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Returns `true` if the error originated from the I/O layer.
    ///
    /// The embedding engine uses this to decide whether to switch
    /// into read-only mode.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns `true` if the job stopped because of a cancellation signal.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SerializeError> for Error {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<DeserializeError> for Error {
    fn from(value: DeserializeError) -> Self {
        Self::Deserialize(value)
    }
}

impl From<DecompressError> for Error {
    fn from(value: DecompressError) -> Self {
        Self::Decompress(value)
    }
}

/// Compaction result
pub type Result<T> = std::result::Result<T, Error>;
