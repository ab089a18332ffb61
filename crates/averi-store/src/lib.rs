//! `SQLite`-backed implementation of the Averi protocol store traits.
//!
//! One connection behind a mutex. Every multi-row write (prekey batches,
//! ratchet commits, key id allocation) runs in its own transaction.

mod db;
pub mod error;
mod identity_repo;
mod message_repo;
mod prekey_repo;
mod session_repo;

use std::path::Path;

use averi_crypto::session::{
    IdentityStore, MailboxStore, OneTimePreKeyRecord, PqPreKeyRecord, PreKeyBatch, PreKeyStore,
    RatchetCommit, Session, SessionId, SessionStore, SignedPreKeyRecord, SkippedKeyId,
    StoredMessage,
};
use averi_crypto::{CryptoError, LocalIdentity};
use parking_lot::Mutex;
use rusqlite::Connection;

pub use db::{timestamp_now, SCHEMA_VERSION};
pub use error::StoreError;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::open(path.as_ref())?),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }

    /// Number of unused classical one-time prekeys.
    pub fn count_one_time_prekeys(&self) -> Result<usize, StoreError> {
        prekey_repo::count_one_time_prekeys(&self.conn.lock())
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl IdentityStore for SqliteStore {
    fn load_identity(&self) -> Result<Option<LocalIdentity>, CryptoError> {
        Ok(identity_repo::load_identity(&self.conn.lock())?)
    }

    fn save_identity(&self, identity: &LocalIdentity) -> Result<(), CryptoError> {
        Ok(identity_repo::save_identity(&self.conn.lock(), identity)?)
    }

    fn pinned_identity(&self, handle: &str) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(identity_repo::pinned_identity(&self.conn.lock(), handle)?)
    }

    fn pin_identity(&self, handle: &str, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        Ok(identity_repo::pin_identity(
            &self.conn.lock(),
            handle,
            identity_key,
        )?)
    }
}

impl PreKeyStore for SqliteStore {
    fn allocate_key_ids(&self, count: u32) -> Result<u32, CryptoError> {
        Ok(self.transaction(|tx| prekey_repo::allocate_key_ids(tx, count))?)
    }

    fn store_prekeys(&self, batch: &PreKeyBatch) -> Result<(), CryptoError> {
        Ok(self.transaction(|tx| prekey_repo::store_prekeys(tx, batch))?)
    }

    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        Ok(prekey_repo::load_signed_prekey(&self.conn.lock(), id)?)
    }

    fn load_pq_prekey(&self, id: u32) -> Result<Option<PqPreKeyRecord>, CryptoError> {
        Ok(prekey_repo::load_pq_prekey(&self.conn.lock(), id)?)
    }

    fn load_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePreKeyRecord>, CryptoError> {
        Ok(prekey_repo::load_one_time_prekey(&self.conn.lock(), id)?)
    }

    fn newest_signed_prekey_at(&self) -> Result<Option<u64>, CryptoError> {
        Ok(prekey_repo::newest_signed_prekey_at(&self.conn.lock())?)
    }

    fn newest_last_resort_pq_prekey_at(&self) -> Result<Option<u64>, CryptoError> {
        Ok(prekey_repo::newest_last_resort_pq_prekey_at(
            &self.conn.lock(),
        )?)
    }
}

impl SessionStore for SqliteStore {
    fn load_session(&self, peer: &str) -> Result<Option<Session>, CryptoError> {
        Ok(session_repo::load_session(&self.conn.lock(), peer)?)
    }

    fn load_skipped_key(&self, id: &SkippedKeyId) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(session_repo::load_skipped_key(&self.conn.lock(), id)?)
    }

    fn count_skipped_keys(&self, session_id: SessionId) -> Result<usize, CryptoError> {
        Ok(session_repo::count_skipped_keys(
            &self.conn.lock(),
            session_id,
        )?)
    }

    fn handshake_seen(&self, peer: &str, ephemeral_key: &[u8; 32]) -> Result<bool, CryptoError> {
        Ok(session_repo::handshake_seen(
            &self.conn.lock(),
            peer,
            ephemeral_key,
        )?)
    }

    fn commit(&self, commit: &RatchetCommit) -> Result<(), CryptoError> {
        self.transaction(|tx| session_repo::apply_commit(tx, commit))
            .inspect_err(|e| {
                tracing::warn!(peer = %commit.session.peer, error = %e, "ratchet commit rolled back");
            })?;
        Ok(())
    }
}

impl MailboxStore for SqliteStore {
    fn append_message(&self, peer: &str, message: &StoredMessage) -> Result<(), CryptoError> {
        Ok(message_repo::insert_message(&self.conn.lock(), peer, message)?)
    }

    fn load_messages(&self, peer: &str) -> Result<Vec<StoredMessage>, CryptoError> {
        Ok(message_repo::load_conversation(&self.conn.lock(), peer)?)
    }
}
