//! XEdDSA signatures over X25519 keys.
//!
//! Lets the identity keypair used for key agreement also sign prekeys and
//! challenges. The Montgomery private scalar is mapped to an Edwards keypair
//! whose public point always has sign bit 0, so a verifier holding only the
//! X25519 u-coordinate can reconstruct it.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

/// Signature length: `R (32) || s (32)`.
pub const SIGNATURE_LEN: usize = 64;

/// `hash_1` domain prefix: the 32-byte little-endian encoding of `2^256 - 2`.
const HASH1_PREFIX: [u8; 32] = {
    let mut prefix = [0xFF; 32];
    prefix[0] = 0xFE;
    prefix
};

/// Sign `message` with the X25519 secret, drawing 64 bytes of nonce
/// randomness from `rng`.
pub fn sign<R: RngCore + CryptoRng>(secret: &[u8; 32], message: &[u8], rng: &mut R) -> [u8; 64] {
    let mut random = Zeroizing::new([0u8; 64]);
    rng.fill_bytes(&mut random[..]);
    sign_with_randomness(secret, message, &random)
}

/// Sign with caller-supplied randomness `Z`.
pub fn sign_with_randomness(secret: &[u8; 32], message: &[u8], random: &[u8; 64]) -> [u8; 64] {
    let (a, public) = calculate_key_pair(secret);

    let r = hash_to_scalar(&[&HASH1_PREFIX, a.as_bytes(), message, random]);
    let big_r = EdwardsPoint::mul_base(&r).compress();
    let h = hash_to_scalar(&[big_r.as_bytes(), public.as_bytes(), message]);
    let s = r + h * a;

    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..32].copy_from_slice(big_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify an XEdDSA signature against an X25519 public key (u-coordinate).
///
/// Rejects wrong lengths, a non-canonical `u` or `R.y`, and a non-reduced `s`.
pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(u) = <[u8; 32]>::try_from(public) else {
        return false;
    };
    let Ok(signature) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    if !is_canonical_field_element(&u) {
        return false;
    }

    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let mut r_y = r_bytes;
    r_y[31] &= 0x7F;
    if !is_canonical_field_element(&r_y) {
        return false;
    }

    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    // u -> y = (u - 1) / (u + 1), sign bit 0.
    let Some(a_point) = MontgomeryPoint(u).to_edwards(0) else {
        return false;
    };
    let a_compressed = a_point.compress();

    let h = hash_to_scalar(&[&r_bytes, a_compressed.as_bytes(), message]);
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&(-h), &a_point, &s);
    r_check.compress() == CompressedEdwardsY(r_bytes)
}

/// Map a Montgomery private key to the Edwards pair `(a, A)` with `A.s = 0`.
fn calculate_key_pair(secret: &[u8; 32]) -> (Scalar, CompressedEdwardsY) {
    let k = Scalar::from_bytes_mod_order(clamp_integer(*secret));
    let e = EdwardsPoint::mul_base(&k);
    let compressed = e.compress();
    if compressed.as_bytes()[31] & 0x80 == 0 {
        (k, compressed)
    } else {
        (-k, (-e).compress())
    }
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// True when the little-endian value is below `p = 2^255 - 19`.
fn is_canonical_field_element(bytes: &[u8; 32]) -> bool {
    if bytes[31] & 0x80 != 0 {
        return false;
    }
    let at_least_p = bytes[31] == 0x7F
        && bytes[1..31].iter().all(|&b| b == 0xFF)
        && bytes[0] >= 0xED;
    !at_least_p
}
