use averi_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },

    #[error("corrupt value in column {column}: {reason}")]
    Corrupt {
        column: &'static str,
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn corrupt(column: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            column,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for CryptoError {
    fn from(e: StoreError) -> Self {
        CryptoError::StorageError(e.to_string())
    }
}

/// Fixed-size key column.
pub(crate) fn to_array<const N: usize>(
    blob: &[u8],
    column: &'static str,
) -> Result<[u8; N], StoreError> {
    <[u8; N]>::try_from(blob)
        .map_err(|_| StoreError::corrupt(column, format!("expected {N} bytes, got {}", blob.len())))
}
