use averi_crypto::CryptoError;
use thiserror::Error;

use crate::provider::FetchError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("no key bundle published for {0}")]
    BundleNotFound(String),

    #[error("key bundle fetch failed: {0}")]
    BundleFetch(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ClientError {
    /// Failures the caller may retry as-is. The client never retries.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BundleFetch(_) | Self::Cancelled => true,
            Self::Crypto(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<FetchError> for ClientError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound(handle) => Self::BundleNotFound(handle),
            FetchError::Other(reason) => Self::BundleFetch(reason),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
