use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::xeddsa;

/// A user's long-term X25519 identity keypair.
///
/// The same key does Diffie-Hellman in the handshake and signs prekeys via
/// XEdDSA, so there is exactly one public key to distribute and pin.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Secret key bytes, for persistence only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// XEdDSA signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        xeddsa::sign(self.secret.as_bytes(), message, &mut OsRng)
    }

    /// Verify an XEdDSA signature made by the holder of `public_key`.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if xeddsa::verify(public_key, message, signature) {
            Ok(())
        } else {
            Err(CryptoError::SignatureInvalid(format!(
                "bad signature from {}",
                fingerprint(public_key)
            )))
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Human-comparable fingerprint of an identity public key (SHA-256, hex).
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// The local account: a handle bound to its identity keypair.
///
/// Passed explicitly into every handshake and ratchet call.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub handle: String,
    pub keys: IdentityKeyPair,
}

impl LocalIdentity {
    pub fn new(handle: impl Into<String>, keys: IdentityKeyPair) -> Self {
        Self {
            handle: handle.into(),
            keys,
        }
    }

    pub fn generate(handle: impl Into<String>) -> Self {
        Self::new(handle, IdentityKeyPair::generate())
    }
}
