use super::EncodingError;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| match *e {
        bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            EncodingError::TruncatedData.into()
        }
        _ => EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)).into(),
    })
}
