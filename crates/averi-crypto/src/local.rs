use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::primitives::{self, KEY_LEN, NONCE_LEN};

const LOCAL_KEY_INFO: &[u8] = b"me.averi.chat_LocalEncryption";

/// A locally stored message payload sealed under the device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMailboxEntry {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Device-local symmetric key for data at rest.
///
/// Derived once from the identity secret with HKDF-SHA256 (no salt). It is
/// independent of every session key and never leaves the device.
#[derive(ZeroizeOnDrop)]
pub struct LocalKey {
    key: [u8; KEY_LEN],
}

impl LocalKey {
    pub fn derive(identity: &IdentityKeyPair) -> Result<Self, CryptoError> {
        let secret = Zeroizing::new(identity.secret_bytes());
        let hk = Hkdf::<Sha256>::new(None, &secret[..]);
        let mut key = [0u8; KEY_LEN];
        hk.expand(LOCAL_KEY_INFO, &mut key)
            .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
        Ok(Self { key })
    }

    /// Seal with a fresh random 24-byte nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMailboxEntry, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = primitives::seal(&self.key, &nonce, plaintext, &[])?;
        Ok(EncryptedMailboxEntry { ciphertext, nonce })
    }

    pub fn decrypt(&self, entry: &EncryptedMailboxEntry) -> Result<Vec<u8>, CryptoError> {
        primitives::open(&self.key, &entry.nonce, &entry.ciphertext, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_derivation() {
        let identity = IdentityKeyPair::generate();
        let key1 = LocalKey::derive(&identity).unwrap();
        let key2 = LocalKey::derive(&identity).unwrap();
        assert_eq!(key1.key, key2.key);

        let other = LocalKey::derive(&IdentityKeyPair::generate()).unwrap();
        assert_ne!(key1.key, other.key);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = LocalKey::derive(&IdentityKeyPair::generate()).unwrap();
        let entry = key.encrypt(b"hello at rest").unwrap();
        assert_ne!(entry.ciphertext, b"hello at rest");
        assert_eq!(key.decrypt(&entry).unwrap(), b"hello at rest");

        // Fresh nonce every time.
        let again = key.encrypt(b"hello at rest").unwrap();
        assert_ne!(entry.nonce, again.nonce);
    }

    #[test]
    fn wrong_key_or_tamper_rejected() {
        let key1 = LocalKey::derive(&IdentityKeyPair::generate()).unwrap();
        let key2 = LocalKey::derive(&IdentityKeyPair::generate()).unwrap();

        let mut entry = key1.encrypt(b"secret data").unwrap();
        assert!(matches!(key2.decrypt(&entry), Err(CryptoError::AuthenticationFailed)));

        entry.nonce[0] ^= 1;
        assert!(matches!(key1.decrypt(&entry), Err(CryptoError::AuthenticationFailed)));
    }
}
