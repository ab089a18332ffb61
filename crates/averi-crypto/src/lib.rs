pub mod error;
pub mod identity;
pub mod kem;
pub mod local;
pub mod primitives;
pub mod session;
pub mod xeddsa;

pub use error::{CryptoError, PreKeyKind};
pub use identity::{fingerprint, IdentityKeyPair, LocalIdentity};
pub use kem::KemKeyPair;
pub use local::{EncryptedMailboxEntry, LocalKey};
pub use session::{
    EncryptedMessage, IdentityPatch, IdentityUpload, KeyBundle, MessageHeader, PqxdhInit,
    ProtocolStore, SessionManager, SessionMessage,
};
