//! Prekey material: private records kept in the local store, the public
//! halves published to the directory, and the registration / rotation /
//! replenishment lifecycle.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, LocalIdentity};
use crate::kem::{KemKeyPair, PUBLIC_KEY_LEN};
use crate::primitives::x25519_public;
use crate::session::store::{IdentityStore, PreKeyStore};

/// Default size of a one-time prekey batch (classical and PQ each).
pub const ONE_TIME_PREKEY_BATCH: usize = 100;

// ── Private records ─────────────────────────────────────────────────

/// X25519 signed prekey with its XEdDSA signature.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    #[zeroize(skip)]
    pub created_at: u64,
}

impl SignedPreKeyRecord {
    pub fn generate(id: u32, identity: &IdentityKeyPair, created_at: u64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            id,
            secret: secret.to_bytes(),
            public,
            signature: identity.sign(&public).to_vec(),
            created_at,
        }
    }

    pub fn from_parts(id: u32, secret: [u8; 32], signature: Vec<u8>, created_at: u64) -> Self {
        let public = x25519_public(&secret);
        Self {
            id,
            secret,
            public,
            signature,
            created_at,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            key: self.public.to_vec(),
            signature: self.signature.clone(),
        }
    }
}

/// ML-KEM-1024 prekey. `one_time` records are deleted after one use; the
/// others are the long-lived last-resort key.
#[derive(Clone)]
pub struct PqPreKeyRecord {
    pub id: u32,
    pub keys: KemKeyPair,
    pub signature: Vec<u8>,
    pub one_time: bool,
    pub created_at: u64,
}

impl PqPreKeyRecord {
    pub fn generate(id: u32, identity: &IdentityKeyPair, one_time: bool, created_at: u64) -> Self {
        let keys = KemKeyPair::generate();
        let signature = identity.sign(keys.public_bytes()).to_vec();
        Self {
            id,
            keys,
            signature,
            one_time,
            created_at,
        }
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            key: self.keys.public_bytes().to_vec(),
            signature: self.signature.clone(),
        }
    }
}

impl std::fmt::Debug for PqPreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqPreKeyRecord")
            .field("id", &self.id)
            .field("one_time", &self.one_time)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Unsigned X25519 one-time prekey.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl OneTimePreKeyRecord {
    pub fn generate(id: u32) -> Self {
        Self::from_secret(id, StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn from_secret(id: u32, secret: [u8; 32]) -> Self {
        let public = x25519_public(&secret);
        Self { id, secret, public }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            key: self.public.to_vec(),
        }
    }
}

impl std::fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("public", &hex::encode(self.public))
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for OneTimePreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKeyRecord")
            .field("id", &self.id)
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// A set of new prekeys written in one store transaction.
#[derive(Debug, Default)]
pub struct PreKeyBatch {
    pub signed: Vec<SignedPreKeyRecord>,
    pub pq: Vec<PqPreKeyRecord>,
    pub one_time: Vec<OneTimePreKeyRecord>,
}

impl PreKeyBatch {
    fn to_patch(&self) -> IdentityPatch {
        IdentityPatch {
            signed_prekey: self.signed.last().map(SignedPreKeyRecord::to_public),
            pq_prekey: self
                .pq
                .iter()
                .rev()
                .find(|r| !r.one_time)
                .map(PqPreKeyRecord::to_public),
            pq_one_time_prekeys: self
                .pq
                .iter()
                .filter(|r| r.one_time)
                .map(PqPreKeyRecord::to_public)
                .collect(),
            one_time_prekeys: self
                .one_time
                .iter()
                .map(OneTimePreKeyRecord::to_public)
                .collect(),
        }
    }
}

// ── Public (directory) types ────────────────────────────────────────

/// A public prekey with the identity key's XEdDSA signature over `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedPreKeyPublic {
    fn verify(&self, identity_key: &[u8]) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(identity_key, &self.key, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub key: Vec<u8>,
}

/// Everything an initiator needs to open a session with `handle`.
///
/// `pq_prekey` is either a one-time PQ prekey or, when the pool is empty,
/// the last-resort one. Both carry a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub handle: String,
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPreKeyPublic,
    pub pq_prekey: SignedPreKeyPublic,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl KeyBundle {
    /// Check key lengths and both prekey signatures against the bundle's
    /// identity key. Fails with `SignatureInvalid` on any bad signature.
    pub fn verify(&self) -> Result<(), CryptoError> {
        if self.identity_key.len() != 32 {
            return Err(CryptoError::InvalidKey("identity key wrong length".into()));
        }
        if self.signed_prekey.key.len() != 32 {
            return Err(CryptoError::InvalidKey("signed prekey wrong length".into()));
        }
        if self.pq_prekey.key.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey("PQ prekey wrong length".into()));
        }
        if let Some(otk) = &self.one_time_prekey {
            if otk.key.len() != 32 {
                return Err(CryptoError::InvalidKey("one-time prekey wrong length".into()));
            }
        }
        self.signed_prekey.verify(&self.identity_key)?;
        self.pq_prekey.verify(&self.identity_key)?;
        Ok(())
    }

    /// Identity key as a fixed array. Call after [`verify`](Self::verify).
    pub fn identity_key_array(&self) -> Result<[u8; 32], CryptoError> {
        <[u8; 32]>::try_from(self.identity_key.as_slice())
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))
    }
}

/// New public prekeys for the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPatch {
    pub signed_prekey: Option<SignedPreKeyPublic>,
    pub pq_prekey: Option<SignedPreKeyPublic>,
    pub pq_one_time_prekeys: Vec<SignedPreKeyPublic>,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.signed_prekey.is_none()
            && self.pq_prekey.is_none()
            && self.pq_one_time_prekeys.is_empty()
            && self.one_time_prekeys.is_empty()
    }
}

/// Initial registration payload for the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUpload {
    pub handle: String,
    pub identity_key: Vec<u8>,
    pub prekeys: IdentityPatch,
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Create and persist a new identity with a full prekey set.
///
/// Generates one signed prekey, one last-resort PQ prekey, `batch` signed
/// one-time PQ prekeys and `batch` one-time prekeys.
pub fn register<S>(
    store: &S,
    handle: &str,
    batch: usize,
    now: u64,
) -> Result<(LocalIdentity, IdentityUpload), CryptoError>
where
    S: IdentityStore + PreKeyStore + ?Sized,
{
    if store.load_identity()?.is_some() {
        return Err(CryptoError::SessionError(
            "an identity is already registered".into(),
        ));
    }
    let identity = LocalIdentity::generate(handle);

    let mut next = store.allocate_key_ids(key_count(2 + 2 * batch)?)?;
    let mut prekeys = PreKeyBatch::default();
    prekeys.signed.push(SignedPreKeyRecord::generate(
        take_id(&mut next),
        &identity.keys,
        now,
    ));
    prekeys.pq.push(PqPreKeyRecord::generate(
        take_id(&mut next),
        &identity.keys,
        false,
        now,
    ));
    fill_one_time(&mut prekeys, &identity.keys, batch, &mut next, now);

    store.save_identity(&identity)?;
    store.store_prekeys(&prekeys)?;

    tracing::info!(
        handle,
        fingerprint = %identity.keys.fingerprint(),
        one_time = batch,
        "registered new identity"
    );

    let upload = IdentityUpload {
        handle: handle.to_string(),
        identity_key: identity.keys.public_key_bytes().to_vec(),
        prekeys: prekeys.to_patch(),
    };
    Ok((identity, upload))
}

/// Rotate the signed prekey and the last-resort PQ prekey when the newest
/// of each is older than `max_age_secs`. Old records stay in the store so
/// handshakes already in flight still find them.
pub fn rotate_if_stale<S>(
    store: &S,
    identity: &LocalIdentity,
    max_age_secs: u64,
    now: u64,
) -> Result<Option<IdentityPatch>, CryptoError>
where
    S: PreKeyStore + ?Sized,
{
    let is_stale =
        |created: Option<u64>| created.is_none_or(|t| now.saturating_sub(t) >= max_age_secs);
    let signed_stale = is_stale(store.newest_signed_prekey_at()?);
    let pq_stale = is_stale(store.newest_last_resort_pq_prekey_at()?);
    if !signed_stale && !pq_stale {
        return Ok(None);
    }

    let count = u32::from(signed_stale) + u32::from(pq_stale);
    let mut next = store.allocate_key_ids(count)?;
    let mut prekeys = PreKeyBatch::default();
    if signed_stale {
        prekeys.signed.push(SignedPreKeyRecord::generate(
            take_id(&mut next),
            &identity.keys,
            now,
        ));
    }
    if pq_stale {
        prekeys.pq.push(PqPreKeyRecord::generate(
            take_id(&mut next),
            &identity.keys,
            false,
            now,
        ));
    }
    store.store_prekeys(&prekeys)?;

    tracing::info!(
        handle = %identity.handle,
        signed = signed_stale,
        pq = pq_stale,
        "rotated stale signed prekeys"
    );
    Ok(Some(prekeys.to_patch()))
}

/// Generate a fresh batch of one-time prekeys (classical and PQ).
pub fn replenish<S>(
    store: &S,
    identity: &LocalIdentity,
    batch: usize,
    now: u64,
) -> Result<IdentityPatch, CryptoError>
where
    S: PreKeyStore + ?Sized,
{
    let mut next = store.allocate_key_ids(key_count(2 * batch)?)?;
    let mut prekeys = PreKeyBatch::default();
    fill_one_time(&mut prekeys, &identity.keys, batch, &mut next, now);
    store.store_prekeys(&prekeys)?;

    tracing::info!(handle = %identity.handle, batch, "replenished one-time prekeys");
    Ok(prekeys.to_patch())
}

fn fill_one_time(
    prekeys: &mut PreKeyBatch,
    identity: &IdentityKeyPair,
    batch: usize,
    next: &mut u32,
    now: u64,
) {
    for _ in 0..batch {
        prekeys
            .pq
            .push(PqPreKeyRecord::generate(take_id(next), identity, true, now));
    }
    for _ in 0..batch {
        prekeys.one_time.push(OneTimePreKeyRecord::generate(take_id(next)));
    }
}

fn take_id(next: &mut u32) -> u32 {
    let id = *next;
    *next += 1;
    id
}

fn key_count(count: usize) -> Result<u32, CryptoError> {
    u32::try_from(count).map_err(|_| CryptoError::SessionError(format!("{count} keys requested")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory_stores::MemoryStore;

    const DAY: u64 = 24 * 60 * 60;

    #[test]
    fn register_generates_full_set() {
        let store = MemoryStore::new();
        let (identity, upload) = register(&store, "alice", 5, 1_000).unwrap();

        assert_eq!(upload.handle, "alice");
        assert_eq!(upload.identity_key, identity.keys.public_key_bytes().to_vec());
        assert!(upload.prekeys.signed_prekey.is_some());
        assert!(upload.prekeys.pq_prekey.is_some());
        assert_eq!(upload.prekeys.pq_one_time_prekeys.len(), 5);
        assert_eq!(upload.prekeys.one_time_prekeys.len(), 5);

        // Every published key has its private half in the store.
        let spk = upload.prekeys.signed_prekey.as_ref().unwrap();
        assert!(store.load_signed_prekey(spk.id).unwrap().is_some());
        for otk in &upload.prekeys.one_time_prekeys {
            assert!(store.load_one_time_prekey(otk.id).unwrap().is_some());
        }
        for pq in &upload.prekeys.pq_one_time_prekeys {
            let record = store.load_pq_prekey(pq.id).unwrap().unwrap();
            assert!(record.one_time);
            IdentityKeyPair::verify(&upload.identity_key, &pq.key, &pq.signature).unwrap();
        }

        // Ids are unique across all tables.
        let mut ids: Vec<u32> = upload
            .prekeys
            .one_time_prekeys
            .iter()
            .map(|k| k.id)
            .chain(upload.prekeys.pq_one_time_prekeys.iter().map(|k| k.id))
            .chain([spk.id, upload.prekeys.pq_prekey.as_ref().unwrap().id])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 12);
    }

    #[test]
    fn register_twice_fails() {
        let store = MemoryStore::new();
        register(&store, "alice", 1, 0).unwrap();
        assert!(register(&store, "alice", 1, 0).is_err());
    }

    #[test]
    fn rotation_only_when_stale() {
        let store = MemoryStore::new();
        let (identity, _) = register(&store, "alice", 1, 0).unwrap();

        assert!(rotate_if_stale(&store, &identity, 7 * DAY, 6 * DAY)
            .unwrap()
            .is_none());

        let patch = rotate_if_stale(&store, &identity, 7 * DAY, 8 * DAY)
            .unwrap()
            .unwrap();
        let new_spk = patch.signed_prekey.unwrap();
        assert!(patch.pq_prekey.is_some());
        assert!(patch.one_time_prekeys.is_empty());
        assert_eq!(store.newest_signed_prekey_at().unwrap(), Some(8 * DAY));
        assert!(store.load_signed_prekey(new_spk.id).unwrap().is_some());

        // Fresh again.
        assert!(rotate_if_stale(&store, &identity, 7 * DAY, 9 * DAY)
            .unwrap()
            .is_none());
    }

    #[test]
    fn replenish_adds_signed_pq_and_classical_keys() {
        let store = MemoryStore::new();
        let (identity, upload) = register(&store, "alice", 2, 0).unwrap();
        let patch = replenish(&store, &identity, 3, 10).unwrap();

        assert!(patch.signed_prekey.is_none());
        assert_eq!(patch.pq_one_time_prekeys.len(), 3);
        assert_eq!(patch.one_time_prekeys.len(), 3);
        for pq in &patch.pq_one_time_prekeys {
            IdentityKeyPair::verify(&upload.identity_key, &pq.key, &pq.signature).unwrap();
        }
        let old_max = upload
            .prekeys
            .one_time_prekeys
            .iter()
            .map(|k| k.id)
            .max()
            .unwrap();
        assert!(patch.one_time_prekeys.iter().all(|k| k.id > old_max));
    }

    fn bundle_for(identity: &IdentityKeyPair) -> KeyBundle {
        KeyBundle {
            handle: "bob".into(),
            identity_key: identity.public_key_bytes().to_vec(),
            signed_prekey: SignedPreKeyRecord::generate(1, identity, 0).to_public(),
            pq_prekey: PqPreKeyRecord::generate(2, identity, false, 0).to_public(),
            one_time_prekey: Some(OneTimePreKeyRecord::generate(3).to_public()),
        }
    }

    #[test]
    fn bundle_verification() {
        let identity = IdentityKeyPair::generate();
        let bundle = bundle_for(&identity);
        bundle.verify().unwrap();

        let mut bad_spk = bundle.clone();
        bad_spk.signed_prekey.key[0] ^= 1;
        assert!(matches!(bad_spk.verify(), Err(CryptoError::SignatureInvalid(_))));

        let mut bad_pq = bundle.clone();
        bad_pq.pq_prekey.signature[10] ^= 1;
        assert!(matches!(bad_pq.verify(), Err(CryptoError::SignatureInvalid(_))));

        let mut foreign = bundle;
        foreign.identity_key = IdentityKeyPair::generate().public_key_bytes().to_vec();
        assert!(matches!(foreign.verify(), Err(CryptoError::SignatureInvalid(_))));
    }

    #[test]
    fn bundle_rejects_bad_lengths() {
        let identity = IdentityKeyPair::generate();
        let mut bundle = bundle_for(&identity);
        bundle.one_time_prekey.as_mut().unwrap().key.pop();
        assert!(matches!(bundle.verify(), Err(CryptoError::InvalidKey(_))));
    }
}
