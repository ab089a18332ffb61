use std::path::{Path, PathBuf};

use averi_crypto::session::prekeys::ONE_TIME_PREKEY_BATCH;
use averi_crypto::session::MAX_SKIP;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Client settings. Every field is optional in the JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Skipped-key bound handed to the ratchet.
    pub max_skip: u32,
    /// Rotate the signed prekeys once the newest is this old.
    pub signed_prekey_max_age_days: u64,
    /// One-time prekeys generated per batch, classical and PQ each.
    pub one_time_prekey_batch: usize,
    pub database_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_skip: MAX_SKIP,
            signed_prekey_max_age_days: 7,
            one_time_prekey_batch: ONE_TIME_PREKEY_BATCH,
            database_path: PathBuf::from("averi.db"),
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.max_skip == 0 {
            return Err(ClientError::Config("max_skip must be positive".into()));
        }
        if self.one_time_prekey_batch == 0 {
            return Err(ClientError::Config(
                "one_time_prekey_batch must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn signed_prekey_max_age_secs(&self) -> u64 {
        self.signed_prekey_max_age_days.saturating_mul(SECS_PER_DAY)
    }
}
