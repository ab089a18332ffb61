pub mod manager;
pub mod memory_stores;
pub mod pqxdh;
pub mod prekeys;
pub mod ratchet;
pub mod state;
pub mod store;

pub use manager::SessionManager;
pub use memory_stores::MemoryStore;
pub use prekeys::{
    IdentityPatch, IdentityUpload, KeyBundle, OneTimePreKeyPublic, OneTimePreKeyRecord,
    PqPreKeyRecord, PreKeyBatch, SignedPreKeyPublic, SignedPreKeyRecord,
};
pub use ratchet::MAX_SKIP;
pub use state::{
    EncryptedMessage, MessageHeader, PqxdhInit, PreKeyIds, Session, SessionId, SessionMessage,
    SkippedKeyId, SkippedMessageKey,
};
pub use store::{
    IdentityStore, MailboxStore, PreKeyStore, ProtocolStore, RatchetCommit, SessionStore,
    StoredMessage,
};
