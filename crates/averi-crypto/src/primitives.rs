//! Key derivation, Diffie-Hellman and AEAD building blocks shared by the
//! handshake and the ratchet.
//!
//! All domain-separation strings are fixed: changing any of them breaks
//! interoperability with every existing session.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of every symmetric key in the protocol.
pub const KEY_LEN: usize = 32;
/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;

const PQXDH_INFO: &[u8] = b"me.averi.chat_CURVE25519_SHA-512_ML-KEM-1024";
const ROOT_KEY_INFO: &[u8] = b"me.averi.chat_DoubleRatchet_RootKey";
const MESSAGE_KEY_INFO: &[u8] = b"me.averi.chat_MessageKey";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// X25519 scalar multiplication.
///
/// Rejects non-contributory results (low-order peer points), which would
/// otherwise feed an all-zero secret into the KDF.
pub fn dh(secret: &StaticSecret, public: &PublicKey) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "peer public key is of low order".into(),
        ));
    }
    Ok(shared.to_bytes())
}

/// PQXDH root secret: HKDF-SHA512 over `0xFF*32 || key_material`, zero salt.
pub fn kdf_pqxdh(key_material: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + key_material.len()));
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(key_material);

    let salt = [0u8; 64];
    let hk = Hkdf::<Sha512>::new(Some(&salt), &ikm);
    let mut sk = [0u8; KEY_LEN];
    hk.expand(PQXDH_INFO, &mut sk)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    Ok(sk)
}

/// Root-chain step: HKDF-SHA256 salted with the root key over the DH output.
///
/// Returns `(new_root_key, new_chain_key)`.
pub fn kdf_rk(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
    hk.expand(ROOT_KEY_INFO, &mut okm[..])
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;

    let mut root = [0u8; KEY_LEN];
    let mut chain = [0u8; KEY_LEN];
    root.copy_from_slice(&okm[..KEY_LEN]);
    chain.copy_from_slice(&okm[KEY_LEN..]);
    Ok((root, chain))
}

/// Symmetric-chain step. Returns `(next_chain_key, message_key)`.
pub fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let next = hmac_sha256(chain_key, CHAIN_KEY_SEED)?;
    let message_key = hmac_sha256(chain_key, MESSAGE_KEY_SEED)?;
    Ok((next, message_key))
}

fn hmac_sha256(key: &[u8; 32], seed: u8) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("HMAC key: {e}")))?;
    mac.update(&[seed]);
    Ok(mac.finalize().into_bytes().into())
}

/// Expand a message key into an AEAD key and nonce (56 bytes, split 32/24).
pub fn derive_message_secret(
    message_key: &[u8; 32],
) -> Result<([u8; KEY_LEN], [u8; NONCE_LEN]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = Zeroizing::new([0u8; KEY_LEN + NONCE_LEN]);
    hk.expand(MESSAGE_KEY_INFO, &mut okm[..])
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;

    let mut key = [0u8; KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    key.copy_from_slice(&okm[..KEY_LEN]);
    nonce.copy_from_slice(&okm[KEY_LEN..]);
    Ok((key, nonce))
}

/// XChaCha20-Poly1305 encrypt. Output is `ciphertext || tag`.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::aead::{Aead, KeyInit, Payload};
    use chacha20poly1305::{XChaCha20Poly1305, XNonce};

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))
}

/// XChaCha20-Poly1305 decrypt. Any tag mismatch (or malformed nonce) yields
/// `AuthenticationFailed` and no plaintext.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::aead::{Aead, KeyInit, Payload};
    use chacha20poly1305::{XChaCha20Poly1305, XNonce};

    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Public half of an X25519 secret.
pub fn x25519_public(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// Parse a 32-byte X25519 public key from wire bytes.
pub fn public_key_from_slice(bytes: &[u8], what: &str) -> Result<PublicKey, CryptoError> {
    let arr = <[u8; 32]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKey(format!("{what} wrong length")))?;
    Ok(PublicKey::from(arr))
}
