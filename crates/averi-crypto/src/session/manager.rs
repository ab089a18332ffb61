//! Session manager: serializes every operation per peer and commits each
//! handshake or ratchet step to the store before returning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CryptoError, PreKeyKind};
use crate::identity::{fingerprint, LocalIdentity};
use crate::session::pqxdh::{self, ResponderPreKeys};
use crate::session::prekeys::KeyBundle;
use crate::session::ratchet;
use crate::session::state::{
    associated_data, new_session_id, EncryptedMessage, PqxdhInit, Session, SessionMessage,
    SkippedKeyId,
};
use crate::session::store::{ProtocolStore, RatchetCommit};

/// Owns the per-peer locks and drives handshakes and ratchet steps against
/// a [`ProtocolStore`].
///
/// Operations on the same peer run one at a time; different peers proceed
/// in parallel. Every successful call has committed its state change before
/// it returns ciphertext or plaintext.
pub struct SessionManager {
    store: Arc<dyn ProtocolStore>,
    max_skip: u32,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ProtocolStore>, max_skip: u32) -> Self {
        Self {
            store,
            max_skip,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` under the lock for `peer`. The lock entry is dropped again
    /// once no other caller holds or waits on it.
    fn with_peer_lock<T>(&self, peer: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let out = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(peer);
        }
        out
    }

    #[cfg(test)]
    fn tracked_peers(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn has_session(&self, peer: &str) -> Result<bool, CryptoError> {
        Ok(self.store.load_session(peer)?.is_some())
    }

    /// Current session state for `peer`.
    pub fn session(&self, peer: &str) -> Result<Option<Session>, CryptoError> {
        self.store.load_session(peer)
    }

    /// Compare `presented` with the key pinned for `peer`.
    ///
    /// Returns the key to pin on first contact, `None` if it matches the pin,
    /// and `KeyMismatch` if it differs.
    pub fn check_pin(
        &self,
        peer: &str,
        presented: &[u8; 32],
    ) -> Result<Option<[u8; 32]>, CryptoError> {
        match self.store.pinned_identity(peer)? {
            None => Ok(Some(*presented)),
            Some(pinned) if pinned == *presented => Ok(None),
            Some(pinned) => {
                let err = CryptoError::KeyMismatch {
                    handle: peer.to_string(),
                    pinned_fingerprint: fingerprint(&pinned),
                    presented_fingerprint: fingerprint(presented),
                };
                tracing::warn!(peer, error = %err, "identity key changed");
                Err(err)
            }
        }
    }

    /// Explicitly accept `identity_key` for `peer` after a mismatch.
    pub fn trust_identity(&self, peer: &str, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        self.with_peer_lock(peer, || {
            self.store.pin_identity(peer, identity_key)?;
            tracing::info!(peer, fingerprint = %fingerprint(identity_key), "identity key trusted");
            Ok(())
        })
    }

    /// Send the first message to `bundle.handle`.
    ///
    /// If a session appeared while the bundle was being fetched, the payload
    /// goes out as a normal ratchet message instead and the bundle is unused.
    pub fn initiate(
        &self,
        identity: &LocalIdentity,
        bundle: &KeyBundle,
        plaintext: &[u8],
    ) -> Result<SessionMessage, CryptoError> {
        let peer = bundle.handle.as_str();
        self.with_peer_lock(peer, || {
            if let Some(session) = self.store.load_session(peer)? {
                return self
                    .encrypt_locked(identity, session, plaintext)
                    .map(SessionMessage::Message);
            }

            bundle.verify().inspect_err(|e| {
                tracing::warn!(peer, error = %e, "rejected key bundle");
            })?;
            let pin = self.check_pin(peer, &bundle.identity_key_array()?)?;

            let (session, init) = pqxdh::initiate(new_session_id(), identity, bundle, plaintext)?;
            let mut commit = RatchetCommit::new(session);
            commit.pin = pin;
            self.store.commit(&commit)?;
            Ok(SessionMessage::PqxdhInit(init))
        })
    }

    /// Encrypt for a peer with an established session.
    pub fn encrypt(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        self.with_peer_lock(peer, || {
            let session = self
                .store
                .load_session(peer)?
                .ok_or_else(|| CryptoError::NoSession(peer.to_string()))?;
            self.encrypt_locked(identity, session, plaintext)
        })
    }

    fn encrypt_locked(
        &self,
        identity: &LocalIdentity,
        mut session: Session,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let ad = associated_data(
            &identity.keys.public_key_bytes(),
            &session.peer_identity,
            &identity.handle,
            &session.peer,
        );
        let message = ratchet::encrypt(&mut session, plaintext, &ad)?;
        self.store.commit(&RatchetCommit::new(session))?;
        Ok(message)
    }

    /// Decrypt a ratchet message from `peer`.
    pub fn decrypt(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        self.with_peer_lock(peer, || self.decrypt_locked(identity, peer, message))
    }

    fn decrypt_locked(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut session = self
            .store
            .load_session(peer)?
            .ok_or_else(|| CryptoError::NoSession(peer.to_string()))?;

        let key_id = SkippedKeyId {
            session_id: session.id,
            dh_public_key: message.header.dh_public_key,
            index: message.header.message_number,
        };
        let cached_key = self.store.load_skipped_key(&key_id)?;
        let cached_total = self.store.count_skipped_keys(session.id)?;
        let ad = associated_data(
            &session.peer_identity,
            &identity.keys.public_key_bytes(),
            peer,
            &identity.handle,
        );

        let decrypted = ratchet::decrypt(
            &mut session,
            message,
            &ad,
            cached_key,
            cached_total,
            self.max_skip,
        )
        .inspect_err(|e| {
            tracing::warn!(peer, n = message.header.message_number, error = %e, "decrypt failed");
        })?;

        let mut commit = RatchetCommit::new(session);
        commit.skipped_keys = decrypted.skipped;
        commit.evicted_skipped_keys = decrypted.evict;
        commit.consumed_skipped_key = decrypted.consumed;
        self.store.commit(&commit)?;
        Ok(decrypted.plaintext)
    }

    /// Accept a handshake from `peer` and return the first plaintext.
    ///
    /// The pin is checked before any prekey is touched. A handshake whose
    /// ephemeral key was already accepted from `peer` is a replay and fails
    /// with `AuthenticationFailed`. Any other new handshake replaces an
    /// existing session with the same peer.
    pub fn accept(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        init: &PqxdhInit,
    ) -> Result<Vec<u8>, CryptoError> {
        self.with_peer_lock(peer, || self.accept_locked(identity, peer, init))
    }

    fn accept_locked(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        init: &PqxdhInit,
    ) -> Result<Vec<u8>, CryptoError> {
        let pin = self.check_pin(peer, &init.id_key)?;
        if self.store.handshake_seen(peer, &init.ephemeral_key)? {
            tracing::warn!(peer, "replayed handshake");
            return Err(CryptoError::AuthenticationFailed);
        }
        let existing = self.store.load_session(peer)?;

        let ids = init.prekey_ids;
        let signed = self
            .store
            .load_signed_prekey(ids.signed)?
            .ok_or(CryptoError::MissingPreKey {
                kind: PreKeyKind::Signed,
                id: ids.signed,
            })?;
        let pq = self
            .store
            .load_pq_prekey(ids.pq)?
            .ok_or(CryptoError::MissingPreKey {
                kind: PreKeyKind::PostQuantum,
                id: ids.pq,
            })?;
        let one_time = match ids.one_time {
            Some(id) => Some(self.store.load_one_time_prekey(id)?.ok_or(
                CryptoError::MissingPreKey {
                    kind: PreKeyKind::OneTime,
                    id,
                },
            )?),
            None => None,
        };

        let prekeys = ResponderPreKeys {
            signed: &signed,
            pq: &pq,
            one_time: one_time.as_ref(),
        };
        let (session, decrypted) =
            pqxdh::respond(new_session_id(), identity, peer, init, &prekeys, self.max_skip)
                .inspect_err(|e| {
                    tracing::warn!(peer, error = %e, "handshake failed");
                })?;

        let mut commit = RatchetCommit::new(session);
        commit.replaced_session = existing.as_ref().map(|s| s.id);
        commit.skipped_keys = decrypted.skipped;
        commit.consumed_one_time_prekey = ids.one_time;
        commit.consumed_pq_prekey = pq.one_time.then_some(pq.id);
        commit.pin = pin;
        commit.accepted_handshake = Some(init.ephemeral_key);
        self.store.commit(&commit)?;

        if commit.replaced_session.is_some() {
            tracing::info!(peer, "replaced existing session");
        }
        Ok(decrypted.plaintext)
    }

    /// Dispatch an incoming message on its variant.
    pub fn receive(
        &self,
        identity: &LocalIdentity,
        peer: &str,
        message: &SessionMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        match message {
            SessionMessage::PqxdhInit(init) => self.accept(identity, peer, init),
            SessionMessage::Message(msg) => self.decrypt(identity, peer, msg),
        }
    }
}
