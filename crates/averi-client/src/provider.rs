//! Key bundle lookup.
//!
//! The client only needs one call from the directory: fetch the bundle for
//! a handle, either consuming a one-time prekey or as a dry run that leaves
//! the server state alone.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use averi_crypto::session::{OneTimePreKeyPublic, SignedPreKeyPublic};
use averi_crypto::{IdentityPatch, IdentityUpload, KeyBundle};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Hand out one-time prekeys; used right before a handshake.
    Consume,
    /// Leave one-time prekeys in place; used for identity lookups.
    DryRun,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no bundle for {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Source of peers' key bundles.
#[async_trait]
pub trait KeyBundleProvider: Send + Sync {
    async fn fetch(&self, handle: &str, mode: FetchMode) -> Result<KeyBundle, FetchError>;
}

#[async_trait]
impl<T: KeyBundleProvider + ?Sized> KeyBundleProvider for Arc<T> {
    async fn fetch(&self, handle: &str, mode: FetchMode) -> Result<KeyBundle, FetchError> {
        (**self).fetch(handle, mode).await
    }
}

// ── Caching ─────────────────────────────────────────────────────────

/// Memoizes dry-run lookups. Consuming fetches always go to the inner
/// provider and drop the cached entry.
pub struct CachingProvider<P> {
    inner: P,
    cache: Mutex<HashMap<String, KeyBundle>>,
}

impl<P: KeyBundleProvider> CachingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate(&self, handle: &str) {
        self.cache.lock().remove(handle);
    }
}

#[async_trait]
impl<P: KeyBundleProvider> KeyBundleProvider for CachingProvider<P> {
    async fn fetch(&self, handle: &str, mode: FetchMode) -> Result<KeyBundle, FetchError> {
        match mode {
            FetchMode::DryRun => {
                if let Some(bundle) = self.cache.lock().get(handle) {
                    return Ok(bundle.clone());
                }
                let bundle = self.inner.fetch(handle, FetchMode::DryRun).await?;
                self.cache.lock().insert(handle.to_string(), bundle.clone());
                Ok(bundle)
            }
            FetchMode::Consume => {
                self.invalidate(handle);
                self.inner.fetch(handle, FetchMode::Consume).await
            }
        }
    }
}

// ── In-process directory ────────────────────────────────────────────

struct DirectoryEntry {
    identity_key: Vec<u8>,
    signed_prekey: SignedPreKeyPublic,
    pq_prekey: SignedPreKeyPublic,
    pq_one_time: VecDeque<SignedPreKeyPublic>,
    one_time: VecDeque<OneTimePreKeyPublic>,
}

/// A directory held in memory, serving bundles the way the relay server
/// does: one-time prekeys are handed out once, and the last-resort PQ
/// prekey stands in when the PQ pool is empty.
#[derive(Default)]
pub struct StaticDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created identity. Replaces any earlier entry.
    pub fn publish(&self, upload: &IdentityUpload) -> Result<(), FetchError> {
        let prekeys = &upload.prekeys;
        let (Some(signed_prekey), Some(pq_prekey)) =
            (prekeys.signed_prekey.clone(), prekeys.pq_prekey.clone())
        else {
            return Err(FetchError::Other(format!(
                "upload for {} lacks a signed or last-resort prekey",
                upload.handle
            )));
        };
        let entry = DirectoryEntry {
            identity_key: upload.identity_key.clone(),
            signed_prekey,
            pq_prekey,
            pq_one_time: prekeys.pq_one_time_prekeys.iter().cloned().collect(),
            one_time: prekeys.one_time_prekeys.iter().cloned().collect(),
        };
        self.entries.lock().insert(upload.handle.clone(), entry);
        Ok(())
    }

    /// Apply a rotation or replenish patch.
    pub fn apply_patch(&self, handle: &str, patch: &IdentityPatch) -> Result<(), FetchError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| FetchError::NotFound(handle.to_string()))?;
        if let Some(signed) = &patch.signed_prekey {
            entry.signed_prekey = signed.clone();
        }
        if let Some(pq) = &patch.pq_prekey {
            entry.pq_prekey = pq.clone();
        }
        entry.pq_one_time.extend(patch.pq_one_time_prekeys.iter().cloned());
        entry.one_time.extend(patch.one_time_prekeys.iter().cloned());
        Ok(())
    }

    /// One-time prekeys left for `handle` (classical, PQ).
    pub fn remaining_one_time(&self, handle: &str) -> Option<(usize, usize)> {
        self.entries
            .lock()
            .get(handle)
            .map(|e| (e.one_time.len(), e.pq_one_time.len()))
    }
}

#[async_trait]
impl KeyBundleProvider for StaticDirectory {
    async fn fetch(&self, handle: &str, mode: FetchMode) -> Result<KeyBundle, FetchError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| FetchError::NotFound(handle.to_string()))?;

        let (one_time_prekey, pq_one_time) = match mode {
            FetchMode::Consume => (entry.one_time.pop_front(), entry.pq_one_time.pop_front()),
            FetchMode::DryRun => (
                entry.one_time.front().cloned(),
                entry.pq_one_time.front().cloned(),
            ),
        };
        tracing::debug!(
            handle,
            ?mode,
            one_time = one_time_prekey.is_some(),
            pq_one_time = pq_one_time.is_some(),
            "served key bundle"
        );

        Ok(KeyBundle {
            handle: handle.to_string(),
            identity_key: entry.identity_key.clone(),
            signed_prekey: entry.signed_prekey.clone(),
            pq_prekey: pq_one_time.unwrap_or_else(|| entry.pq_prekey.clone()),
            one_time_prekey,
        })
    }
}
