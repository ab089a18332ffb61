//! PQXDH key agreement.
//!
//! Four X25519 exchanges plus one ML-KEM-1024 encapsulation feed a single
//! HKDF-SHA512 call. Both roles build the key material in the same order:
//! `DH1 || DH2 || DH3 || DH4? || KEM shared secret`.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::LocalIdentity;
use crate::kem;
use crate::primitives::{dh, kdf_pqxdh, public_key_from_slice};
use crate::session::prekeys::{KeyBundle, OneTimePreKeyRecord, PqPreKeyRecord, SignedPreKeyRecord};
use crate::session::ratchet::{self, Decrypted};
use crate::session::state::{associated_data, PqxdhInit, PreKeyIds, Session, SessionId};

/// The responder's prekeys referenced by a [`PqxdhInit`].
pub struct ResponderPreKeys<'a> {
    pub signed: &'a SignedPreKeyRecord,
    pub pq: &'a PqPreKeyRecord,
    pub one_time: Option<&'a OneTimePreKeyRecord>,
}

/// Run the initiator side and encrypt the first payload. Returns the new
/// session and the handshake message to send.
///
/// `bundle` must already have passed [`KeyBundle::verify`].
pub fn initiate(
    session_id: SessionId,
    identity: &LocalIdentity,
    bundle: &KeyBundle,
    plaintext: &[u8],
) -> Result<(Session, PqxdhInit), CryptoError> {
    let peer_identity = bundle.identity_key_array()?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);

    let agreement = initiator_agreement(identity, bundle, &ephemeral)?;
    let signed_prekey = public_key_from_slice(&bundle.signed_prekey.key, "signed prekey")?;

    let mut session = ratchet::initiator_session(
        session_id,
        &bundle.handle,
        peer_identity,
        &agreement.shared_secret,
        signed_prekey.to_bytes(),
    )?;

    let ad = associated_data(
        &identity.keys.public_key_bytes(),
        &peer_identity,
        &identity.handle,
        &bundle.handle,
    );
    let initial_message = ratchet::encrypt(&mut session, plaintext, &ad)?;

    tracing::info!(
        peer = %bundle.handle,
        one_time_prekey = bundle.one_time_prekey.is_some(),
        "initiated PQXDH session"
    );

    let init = PqxdhInit {
        id_key: identity.keys.public_key_bytes(),
        ephemeral_key: PublicKey::from(&ephemeral).to_bytes(),
        pqkem_ciphertext: agreement.kem_ciphertext,
        prekey_ids: PreKeyIds {
            signed: bundle.signed_prekey.id,
            pq: bundle.pq_prekey.id,
            one_time: bundle.one_time_prekey.as_ref().map(|k| k.id),
        },
        initial_message,
    };
    Ok((session, init))
}

/// Run the responder side and decrypt the embedded first message.
///
/// `peer` is the handle the message arrived from; the caller has already
/// checked `init.id_key` against the pin for that handle.
pub fn respond(
    session_id: SessionId,
    identity: &LocalIdentity,
    peer: &str,
    init: &PqxdhInit,
    prekeys: &ResponderPreKeys<'_>,
    max_skip: u32,
) -> Result<(Session, Decrypted), CryptoError> {
    let shared_secret = responder_agreement(identity, init, prekeys)?;

    let mut session = ratchet::responder_session(
        session_id,
        peer,
        init.id_key,
        &shared_secret,
        &prekeys.signed.secret(),
    );

    let ad = associated_data(
        &init.id_key,
        &identity.keys.public_key_bytes(),
        peer,
        &identity.handle,
    );
    let decrypted = ratchet::decrypt(&mut session, &init.initial_message, &ad, None, 0, max_skip)?;

    tracing::info!(
        peer,
        signed_prekey = prekeys.signed.id,
        pq_prekey = prekeys.pq.id,
        one_time_prekey = ?prekeys.one_time.map(|k| k.id),
        "accepted PQXDH session"
    );
    Ok((session, decrypted))
}

struct InitiatorAgreement {
    shared_secret: Zeroizing<[u8; 32]>,
    kem_ciphertext: Vec<u8>,
}

fn initiator_agreement(
    identity: &LocalIdentity,
    bundle: &KeyBundle,
    ephemeral: &StaticSecret,
) -> Result<InitiatorAgreement, CryptoError> {
    let their_identity = public_key_from_slice(&bundle.identity_key, "identity key")?;
    let signed_prekey = public_key_from_slice(&bundle.signed_prekey.key, "signed prekey")?;
    let (kem_ciphertext, kem_secret) = kem::encapsulate(&bundle.pq_prekey.key)?;

    let mut km = Zeroizing::new(Vec::with_capacity(4 * 32 + kem_secret.len()));
    km.extend_from_slice(&dh(identity.keys.secret(), &signed_prekey)?);
    km.extend_from_slice(&dh(ephemeral, &their_identity)?);
    km.extend_from_slice(&dh(ephemeral, &signed_prekey)?);
    if let Some(otk) = &bundle.one_time_prekey {
        let one_time = public_key_from_slice(&otk.key, "one-time prekey")?;
        km.extend_from_slice(&dh(ephemeral, &one_time)?);
    }
    km.extend_from_slice(&kem_secret);

    Ok(InitiatorAgreement {
        shared_secret: Zeroizing::new(kdf_pqxdh(&km)?),
        kem_ciphertext,
    })
}

fn responder_agreement(
    identity: &LocalIdentity,
    init: &PqxdhInit,
    prekeys: &ResponderPreKeys<'_>,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let their_identity = PublicKey::from(init.id_key);
    let their_ephemeral = PublicKey::from(init.ephemeral_key);
    let kem_secret = prekeys.pq.keys.decapsulate(&init.pqkem_ciphertext)?;
    let signed = prekeys.signed.secret();

    let mut km = Zeroizing::new(Vec::with_capacity(4 * 32 + kem_secret.len()));
    km.extend_from_slice(&dh(&signed, &their_identity)?);
    km.extend_from_slice(&dh(identity.keys.secret(), &their_ephemeral)?);
    km.extend_from_slice(&dh(&signed, &their_ephemeral)?);
    if let Some(otk) = prekeys.one_time {
        km.extend_from_slice(&dh(&otk.secret(), &their_ephemeral)?);
    }
    km.extend_from_slice(&kem_secret);

    Ok(Zeroizing::new(kdf_pqxdh(&km)?))
}
