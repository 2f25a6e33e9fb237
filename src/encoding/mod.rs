pub mod bincode;

use crate::error::Result;

/// Trait for keys whose encoded form sorts the same way as the key itself.
///
/// Delta keys are handed to the file writer in this form, so a byte-wise
/// comparison of two encoded keys must agree with their `Ord`.
pub trait Key {
    /// Encode the key to bytes while preserving sort order
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key type
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    TruncatedData,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::Encoding(err.to_string())
    }
}
