//! In-memory implementation of every store trait.
//!
//! Suitable for tests and for short-lived tools. Data is lost on process exit;
//! the durable implementation lives in `averi-store`.

use std::collections::{HashMap, HashSet};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::identity::LocalIdentity;
use crate::session::prekeys::{OneTimePreKeyRecord, PqPreKeyRecord, PreKeyBatch, SignedPreKeyRecord};
use crate::session::state::{Session, SessionId, SkippedKeyId};
use crate::session::store::{
    IdentityStore, MailboxStore, PreKeyStore, RatchetCommit, SessionStore, StoredMessage,
};

#[derive(Default)]
struct Inner {
    identity: Option<LocalIdentity>,
    pinned: HashMap<String, [u8; 32]>,
    next_key_id: u32,
    signed_prekeys: HashMap<u32, SignedPreKeyRecord>,
    pq_prekeys: HashMap<u32, PqPreKeyRecord>,
    one_time_prekeys: HashMap<u32, OneTimePreKeyRecord>,
    sessions: HashMap<String, Session>,
    /// Message key plus insertion sequence, for oldest-first eviction.
    skipped: HashMap<SkippedKeyId, ([u8; 32], u64)>,
    next_skipped_seq: u64,
    handshakes: HashSet<(String, [u8; 32])>,
    mailbox: HashMap<String, Vec<StoredMessage>>,
}

/// All protocol state behind one lock, so `commit` is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    #[cfg(test)]
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail without writing anything.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Forget the session with `peer` (pins and prekeys stay).
    #[cfg(test)]
    pub(crate) fn remove_session(&self, peer: &str) {
        self.inner.lock().sessions.remove(peer);
    }
}

impl IdentityStore for MemoryStore {
    fn load_identity(&self) -> Result<Option<LocalIdentity>, CryptoError> {
        Ok(self.inner.lock().identity.clone())
    }

    fn save_identity(&self, identity: &LocalIdentity) -> Result<(), CryptoError> {
        self.inner.lock().identity = Some(identity.clone());
        Ok(())
    }

    fn pinned_identity(&self, handle: &str) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(self.inner.lock().pinned.get(handle).copied())
    }

    fn pin_identity(&self, handle: &str, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        self.inner
            .lock()
            .pinned
            .insert(handle.to_string(), *identity_key);
        Ok(())
    }
}

impl PreKeyStore for MemoryStore {
    fn allocate_key_ids(&self, count: u32) -> Result<u32, CryptoError> {
        let mut inner = self.inner.lock();
        let first = inner.next_key_id;
        inner.next_key_id = first
            .checked_add(count)
            .ok_or_else(|| CryptoError::StorageError("key id space exhausted".into()))?;
        Ok(first)
    }

    fn store_prekeys(&self, batch: &PreKeyBatch) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock();
        for record in &batch.signed {
            inner.signed_prekeys.insert(record.id, record.clone());
        }
        for record in &batch.pq {
            inner.pq_prekeys.insert(record.id, record.clone());
        }
        for record in &batch.one_time {
            inner.one_time_prekeys.insert(record.id, record.clone());
        }
        Ok(())
    }

    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        Ok(self.inner.lock().signed_prekeys.get(&id).cloned())
    }

    fn load_pq_prekey(&self, id: u32) -> Result<Option<PqPreKeyRecord>, CryptoError> {
        Ok(self.inner.lock().pq_prekeys.get(&id).cloned())
    }

    fn load_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePreKeyRecord>, CryptoError> {
        Ok(self.inner.lock().one_time_prekeys.get(&id).cloned())
    }

    fn newest_signed_prekey_at(&self) -> Result<Option<u64>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .signed_prekeys
            .values()
            .map(|r| r.created_at)
            .max())
    }

    fn newest_last_resort_pq_prekey_at(&self) -> Result<Option<u64>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .pq_prekeys
            .values()
            .filter(|r| !r.one_time)
            .map(|r| r.created_at)
            .max())
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&self, peer: &str) -> Result<Option<Session>, CryptoError> {
        Ok(self.inner.lock().sessions.get(peer).cloned())
    }

    fn load_skipped_key(&self, id: &SkippedKeyId) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(self.inner.lock().skipped.get(id).map(|(key, _)| *key))
    }

    fn count_skipped_keys(&self, session_id: SessionId) -> Result<usize, CryptoError> {
        Ok(self
            .inner
            .lock()
            .skipped
            .keys()
            .filter(|k| k.session_id == session_id)
            .count())
    }

    fn handshake_seen(&self, peer: &str, ephemeral_key: &[u8; 32]) -> Result<bool, CryptoError> {
        Ok(self
            .inner
            .lock()
            .handshakes
            .contains(&(peer.to_string(), *ephemeral_key)))
    }

    fn commit(&self, commit: &RatchetCommit) -> Result<(), CryptoError> {
        #[cfg(test)]
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(CryptoError::StorageError("injected commit failure".into()));
        }

        let mut inner = self.inner.lock();
        if let Some(old) = commit.replaced_session {
            inner.skipped.retain(|k, _| k.session_id != old);
        }
        if let Some(id) = &commit.consumed_skipped_key {
            inner.skipped.remove(id);
        }
        if commit.evicted_skipped_keys > 0 {
            let session_id = commit.session.id;
            let mut oldest: Vec<(u64, SkippedKeyId)> = inner
                .skipped
                .iter()
                .filter(|(k, _)| k.session_id == session_id)
                .map(|(k, (_, seq))| (*seq, *k))
                .collect();
            oldest.sort_unstable_by_key(|(seq, _)| *seq);
            for (_, id) in oldest.into_iter().take(commit.evicted_skipped_keys) {
                inner.skipped.remove(&id);
            }
        }
        for key in &commit.skipped_keys {
            let seq = inner.next_skipped_seq;
            inner.next_skipped_seq += 1;
            inner.skipped.insert(key.id, (key.message_key, seq));
        }
        if let Some(id) = commit.consumed_one_time_prekey {
            inner.one_time_prekeys.remove(&id);
        }
        if let Some(id) = commit.consumed_pq_prekey {
            inner.pq_prekeys.remove(&id);
        }
        if let Some(key) = commit.pin {
            inner.pinned.insert(commit.session.peer.clone(), key);
        }
        if let Some(ephemeral) = commit.accepted_handshake {
            inner
                .handshakes
                .insert((commit.session.peer.clone(), ephemeral));
        }
        inner
            .sessions
            .insert(commit.session.peer.clone(), commit.session.clone());
        Ok(())
    }
}

impl MailboxStore for MemoryStore {
    fn append_message(&self, peer: &str, message: &StoredMessage) -> Result<(), CryptoError> {
        self.inner
            .lock()
            .mailbox
            .entry(peer.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn load_messages(&self, peer: &str) -> Result<Vec<StoredMessage>, CryptoError> {
        Ok(self
            .inner
            .lock()
            .mailbox
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }
}
