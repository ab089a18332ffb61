use crate::error::CryptoError;
use crate::identity::LocalIdentity;
use crate::local::EncryptedMailboxEntry;
use crate::session::prekeys::{OneTimePreKeyRecord, PqPreKeyRecord, PreKeyBatch, SignedPreKeyRecord};
use crate::session::state::{Session, SessionId, SkippedKeyId, SkippedMessageKey};

/// Storage for the local identity and the identity keys pinned per handle.
pub trait IdentityStore: Send + Sync {
    /// The local identity, if one has been registered.
    fn load_identity(&self) -> Result<Option<LocalIdentity>, CryptoError>;

    fn save_identity(&self, identity: &LocalIdentity) -> Result<(), CryptoError>;

    /// The identity key the user accepted for `handle`.
    fn pinned_identity(&self, handle: &str) -> Result<Option<[u8; 32]>, CryptoError>;

    /// Pin (or re-pin after explicit confirmation) an identity key.
    fn pin_identity(&self, handle: &str, identity_key: &[u8; 32]) -> Result<(), CryptoError>;
}

/// Storage for the private halves of our prekeys.
///
/// One-time records are removed only through [`SessionStore::commit`], so
/// their consumption lands together with the session that used them.
pub trait PreKeyStore: Send + Sync {
    /// Reserve `count` consecutive key ids and return the first.
    fn allocate_key_ids(&self, count: u32) -> Result<u32, CryptoError>;

    /// Persist a batch of new prekeys in one write.
    fn store_prekeys(&self, batch: &PreKeyBatch) -> Result<(), CryptoError>;

    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError>;

    fn load_pq_prekey(&self, id: u32) -> Result<Option<PqPreKeyRecord>, CryptoError>;

    fn load_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePreKeyRecord>, CryptoError>;

    /// Creation time of the newest signed prekey.
    fn newest_signed_prekey_at(&self) -> Result<Option<u64>, CryptoError>;

    /// Creation time of the newest last-resort (not one-time) PQ prekey.
    fn newest_last_resort_pq_prekey_at(&self) -> Result<Option<u64>, CryptoError>;
}

/// Storage for sessions and their skipped-message-key cache.
///
/// Exactly one session per peer. All mutations go through `commit`.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, peer: &str) -> Result<Option<Session>, CryptoError>;

    fn load_skipped_key(&self, id: &SkippedKeyId) -> Result<Option<[u8; 32]>, CryptoError>;

    fn count_skipped_keys(&self, session_id: SessionId) -> Result<usize, CryptoError>;

    /// Whether a handshake with this ephemeral key was already accepted
    /// from `peer`.
    fn handshake_seen(&self, peer: &str, ephemeral_key: &[u8; 32]) -> Result<bool, CryptoError>;

    /// Apply one ratchet step atomically: either every part of `commit` is
    /// durable afterwards or none of it is.
    fn commit(&self, commit: &RatchetCommit) -> Result<(), CryptoError>;
}

/// A plaintext message sealed under the local key, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sender: String,
    pub entry: EncryptedMailboxEntry,
    pub timestamp: u64,
}

/// Storage for the local, encrypted copy of each conversation.
pub trait MailboxStore: Send + Sync {
    fn append_message(&self, peer: &str, message: &StoredMessage) -> Result<(), CryptoError>;

    /// All messages of the conversation with `peer`, oldest first.
    fn load_messages(&self, peer: &str) -> Result<Vec<StoredMessage>, CryptoError>;
}

/// Everything a client needs from its local store.
pub trait ProtocolStore: IdentityStore + PreKeyStore + SessionStore + MailboxStore {}

impl<T> ProtocolStore for T where T: IdentityStore + PreKeyStore + SessionStore + MailboxStore {}

/// The writes produced by one handshake or ratchet step.
#[derive(Debug)]
pub struct RatchetCommit {
    /// New state of the session (inserted or replacing the peer's row).
    pub session: Session,
    /// Session this one replaces; its skipped keys are purged.
    pub replaced_session: Option<SessionId>,
    pub skipped_keys: Vec<SkippedMessageKey>,
    /// Oldest cached keys of this session to drop before `skipped_keys`
    /// are added.
    pub evicted_skipped_keys: usize,
    pub consumed_skipped_key: Option<SkippedKeyId>,
    pub consumed_one_time_prekey: Option<u32>,
    pub consumed_pq_prekey: Option<u32>,
    /// Identity key to pin for the session's peer (first contact).
    pub pin: Option<[u8; 32]>,
    /// Ephemeral key of the handshake that created this session.
    pub accepted_handshake: Option<[u8; 32]>,
}

impl RatchetCommit {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            replaced_session: None,
            skipped_keys: Vec::new(),
            evicted_skipped_keys: 0,
            consumed_skipped_key: None,
            consumed_one_time_prekey: None,
            consumed_pq_prekey: None,
            pin: None,
            accepted_handshake: None,
        }
    }
}
