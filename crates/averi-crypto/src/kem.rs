//! ML-KEM-1024 key encapsulation used by the PQ prekeys.

use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as KemPublicKey, SecretKey as KemSecretKey, SharedSecret as _,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Encapsulation key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 1568;
/// Ciphertext length in bytes.
pub const CIPHERTEXT_LEN: usize = 1568;

/// An ML-KEM-1024 keypair held as raw bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemKeyPair {
    #[zeroize(skip)]
    public: Vec<u8>,
    secret: Vec<u8>,
}

impl KemKeyPair {
    pub fn generate() -> Self {
        let (public, secret) = mlkem1024::keypair();
        Self {
            public: KemPublicKey::as_bytes(&public).to_vec(),
            secret: KemSecretKey::as_bytes(&secret).to_vec(),
        }
    }

    /// Restore a keypair loaded from storage. Both halves are length-checked.
    /// The secret is copied, so the caller keeps control of wiping its buffer.
    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        mlkem1024::PublicKey::from_bytes(public)
            .map_err(|e| CryptoError::InvalidKey(format!("ML-KEM public key: {e:?}")))?;
        mlkem1024::SecretKey::from_bytes(secret)
            .map_err(|e| CryptoError::InvalidKey(format!("ML-KEM secret key: {e:?}")))?;
        Ok(Self {
            public: public.to_vec(),
            secret: secret.to_vec(),
        })
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }

    /// Recover the shared secret from a ciphertext addressed to this key.
    ///
    /// ML-KEM decapsulation is implicitly rejecting: a tampered ciphertext
    /// yields an unrelated secret, which surfaces later as an AEAD failure.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let ct = mlkem1024::Ciphertext::from_bytes(ciphertext)
            .map_err(|e| CryptoError::Kem(format!("ciphertext: {e:?}")))?;
        let sk = mlkem1024::SecretKey::from_bytes(&self.secret)
            .map_err(|e| CryptoError::InvalidKey(format!("ML-KEM secret key: {e:?}")))?;
        let shared = mlkem1024::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

/// Encapsulate against a peer's encapsulation key.
///
/// Returns `(ciphertext, shared_secret)`.
pub fn encapsulate(public: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
    let pk = mlkem1024::PublicKey::from_bytes(public)
        .map_err(|e| CryptoError::InvalidKey(format!("ML-KEM public key: {e:?}")))?;
    let (shared, ct) = mlkem1024::encapsulate(&pk);
    Ok((ct.as_bytes().to_vec(), Zeroizing::new(shared.as_bytes().to_vec())))
}
