//! Double Ratchet over a single [`Session`].
//!
//! Functions here mutate the session in place and return the skipped-key
//! writes separately. Callers work on a copy and commit it only on success,
//! so a failed decrypt never changes stored state.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::primitives::{self, dh, kdf_ck, kdf_rk};
use crate::session::state::{
    EncryptedMessage, MessageHeader, Session, SessionId, SkippedKeyId, SkippedMessageKey,
};

/// Policy bound on skipped message keys: per decrypt, and on the number
/// cached per session.
pub const MAX_SKIP: u32 = 1000;

/// Result of a successful decrypt.
#[derive(Debug)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    /// Keys cached while skipping ahead.
    pub skipped: Vec<SkippedMessageKey>,
    /// Cached key that was used (and must now be deleted).
    pub consumed: Option<SkippedKeyId>,
    /// How many of the session's oldest cached keys to drop so the cache
    /// stays within the bound once `skipped` is added.
    pub evict: usize,
}

/// Initiator state right after PQXDH: one root step ahead of the responder.
pub(crate) fn initiator_session(
    id: SessionId,
    peer: &str,
    peer_identity: [u8; 32],
    shared_secret: &[u8; 32],
    remote_ratchet: [u8; 32],
) -> Result<Session, CryptoError> {
    let dhs = StaticSecret::random_from_rng(OsRng);
    let dh_out = dh(&dhs, &PublicKey::from(remote_ratchet))?;
    let (root_key, sending_chain_key) = kdf_rk(shared_secret, &dh_out)?;

    let mut session = Session {
        id,
        peer: peer.to_string(),
        peer_identity,
        root_key,
        sending_chain_key: Some(sending_chain_key),
        receiving_chain_key: None,
        dhs_secret: [0u8; 32],
        dhs_public: [0u8; 32],
        dhr: Some(remote_ratchet),
        ns: 0,
        nr: 0,
        pn: 0,
    };
    session.set_ratchet_keypair(&dhs);
    Ok(session)
}

/// Responder state right after PQXDH: the signed prekey is the first
/// ratchet keypair and no chain exists until the first message arrives.
pub(crate) fn responder_session(
    id: SessionId,
    peer: &str,
    peer_identity: [u8; 32],
    shared_secret: &[u8; 32],
    own_ratchet: &StaticSecret,
) -> Session {
    let mut session = Session {
        id,
        peer: peer.to_string(),
        peer_identity,
        root_key: *shared_secret,
        sending_chain_key: None,
        receiving_chain_key: None,
        dhs_secret: [0u8; 32],
        dhs_public: [0u8; 32],
        dhr: None,
        ns: 0,
        nr: 0,
        pn: 0,
    };
    session.set_ratchet_keypair(own_ratchet);
    session
}

pub fn encrypt(
    session: &mut Session,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<EncryptedMessage, CryptoError> {
    let chain_key = session
        .sending_chain_key
        .ok_or_else(|| CryptoError::SessionError("no sending chain yet".into()))?;
    let next_ns = session
        .ns
        .checked_add(1)
        .ok_or_else(|| CryptoError::SessionError("sending chain exhausted".into()))?;

    let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
    let (aead_key, nonce) = primitives::derive_message_secret(&message_key)?;
    let ciphertext = primitives::seal(&aead_key, &nonce, plaintext, associated_data)?;

    let header = MessageHeader {
        dh_public_key: session.dhs_public,
        previous_chain_len: session.pn,
        message_number: session.ns,
    };
    session.sending_chain_key = Some(next_chain_key);
    session.ns = next_ns;

    tracing::debug!(
        peer = %session.peer,
        n = header.message_number,
        pn = header.previous_chain_len,
        "ratchet encrypt"
    );
    Ok(EncryptedMessage {
        header,
        ciphertext,
        nonce,
    })
}

/// Decrypt `message`.
///
/// `cached_key` is the skipped key stored for this header, if any, and
/// `cached_total` the number of skipped keys already stored for the session.
/// A full cache never blocks a decrypt; the oldest keys are evicted instead.
pub fn decrypt(
    session: &mut Session,
    message: &EncryptedMessage,
    associated_data: &[u8],
    cached_key: Option<[u8; 32]>,
    cached_total: usize,
    max_skip: u32,
) -> Result<Decrypted, CryptoError> {
    let header = &message.header;

    if let Some(message_key) = cached_key {
        let plaintext = open_with(&message_key, message, associated_data)?;
        tracing::debug!(
            peer = %session.peer,
            n = header.message_number,
            "decrypted with skipped key"
        );
        return Ok(Decrypted {
            plaintext,
            skipped: Vec::new(),
            consumed: Some(SkippedKeyId {
                session_id: session.id,
                dh_public_key: header.dh_public_key,
                index: header.message_number,
            }),
            evict: 0,
        });
    }

    let mut skipped = Vec::new();

    if session.dhr == Some(header.dh_public_key) {
        if header.message_number < session.nr {
            // Already delivered, or its skipped key was consumed.
            return Err(CryptoError::AuthenticationFailed);
        }
    } else {
        skip_message_keys(session, header.previous_chain_len, &mut skipped, max_skip)?;
        dh_ratchet(session, header)?;
    }
    skip_message_keys(session, header.message_number, &mut skipped, max_skip)?;

    let chain_key = session
        .receiving_chain_key
        .ok_or_else(|| CryptoError::SessionError("no receiving chain".into()))?;
    let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
    session.receiving_chain_key = Some(next_chain_key);
    session.nr = session
        .nr
        .checked_add(1)
        .ok_or_else(|| CryptoError::SessionError("receiving chain exhausted".into()))?;

    let plaintext = open_with(&message_key, message, associated_data)?;
    let evict = (cached_total + skipped.len()).saturating_sub(max_skip as usize);
    if evict > 0 {
        tracing::info!(peer = %session.peer, evict, "skipped-key cache full, evicting oldest");
    }
    tracing::debug!(
        peer = %session.peer,
        n = header.message_number,
        skipped = skipped.len(),
        "ratchet decrypt"
    );
    Ok(Decrypted {
        plaintext,
        skipped,
        consumed: None,
        evict,
    })
}

fn open_with(
    message_key: &[u8; 32],
    message: &EncryptedMessage,
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    // The nonce is the transmitted one; the derived nonce only seals.
    let (aead_key, _) = primitives::derive_message_secret(message_key)?;
    primitives::open(&aead_key, &message.nonce, &message.ciphertext, associated_data)
}

/// Advance the receiving chain to `until`, caching every skipped key.
///
/// A single gap of `max_skip` or more is refused, as is a decrypt that would
/// skip more than `max_skip` keys in total. Checks run before any key is
/// derived.
fn skip_message_keys(
    session: &mut Session,
    until: u32,
    skipped: &mut Vec<SkippedMessageKey>,
    max_skip: u32,
) -> Result<(), CryptoError> {
    let (Some(mut chain_key), Some(dhr)) = (session.receiving_chain_key, session.dhr) else {
        return Ok(());
    };
    if until <= session.nr {
        return Ok(());
    }

    let gap = until - session.nr;
    if gap >= max_skip || skipped.len() + gap as usize > max_skip as usize {
        tracing::warn!(
            peer = %session.peer,
            gap,
            limit = max_skip,
            "refusing to skip messages"
        );
        return Err(CryptoError::TooManySkippedMessages {
            requested: u64::from(gap),
            limit: max_skip,
        });
    }

    while session.nr < until {
        let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
        skipped.push(SkippedMessageKey {
            id: SkippedKeyId {
                session_id: session.id,
                dh_public_key: dhr,
                index: session.nr,
            },
            message_key,
        });
        chain_key = next_chain_key;
        session.nr += 1;
    }
    session.receiving_chain_key = Some(chain_key);
    Ok(())
}

fn dh_ratchet(session: &mut Session, header: &MessageHeader) -> Result<(), CryptoError> {
    let remote = PublicKey::from(header.dh_public_key);

    session.pn = session.ns;
    session.ns = 0;
    session.nr = 0;
    session.dhr = Some(header.dh_public_key);

    let dh_recv = dh(&session.ratchet_secret(), &remote)?;
    let (root_key, receiving_chain_key) = kdf_rk(&session.root_key, &dh_recv)?;

    let dhs = StaticSecret::random_from_rng(OsRng);
    let dh_send = dh(&dhs, &remote)?;
    let (root_key, sending_chain_key) = kdf_rk(&root_key, &dh_send)?;

    session.root_key = root_key;
    session.receiving_chain_key = Some(receiving_chain_key);
    session.sending_chain_key = Some(sending_chain_key);
    session.set_ratchet_keypair(&dhs);

    tracing::debug!(peer = %session.peer, pn = session.pn, "dh ratchet step");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const AD_AB: &[u8] = b"alice->bob";
    const AD_BA: &[u8] = b"bob->alice";

    /// Alice as initiator, Bob as responder, sharing `sk`.
    fn pair() -> (Session, Session) {
        let sk = [42u8; 32];
        let bob_ratchet = StaticSecret::random_from_rng(OsRng);
        let alice = initiator_session(
            1,
            "bob",
            [0u8; 32],
            &sk,
            PublicKey::from(&bob_ratchet).to_bytes(),
        )
        .unwrap();
        let bob = responder_session(2, "alice", [0u8; 32], &sk, &bob_ratchet);
        (alice, bob)
    }

    /// Decrypt against `cache`, oldest key first, applying the same
    /// consume/evict/insert steps a store commit would.
    fn recv(
        session: &mut Session,
        cache: &mut Vec<SkippedMessageKey>,
        msg: &EncryptedMessage,
        ad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        recv_bounded(session, cache, msg, ad, MAX_SKIP)
    }

    fn recv_bounded(
        session: &mut Session,
        cache: &mut Vec<SkippedMessageKey>,
        msg: &EncryptedMessage,
        ad: &[u8],
        max_skip: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let position = cache.iter().position(|k| {
            k.id.dh_public_key == msg.header.dh_public_key && k.id.index == msg.header.message_number
        });
        let cached_key = position.map(|i| cache[i].message_key);
        let mut working = session.clone();
        let out = decrypt(&mut working, msg, ad, cached_key, cache.len(), max_skip)?;
        *session = working;
        if let Some(i) = position {
            cache.remove(i);
        }
        cache.drain(..out.evict);
        cache.extend(out.skipped);
        Ok(out.plaintext)
    }

    #[test]
    fn ping_pong_round_trip() {
        let (mut alice, mut bob) = pair();
        let (mut ca, mut cb) = (Vec::new(), Vec::new());

        for round in 0..4u8 {
            let m = encrypt(&mut alice, &[round], AD_AB).unwrap();
            assert_eq!(recv(&mut bob, &mut cb, &m, AD_AB).unwrap(), vec![round]);
            let r = encrypt(&mut bob, &[round, 1], AD_BA).unwrap();
            assert_eq!(recv(&mut alice, &mut ca, &r, AD_BA).unwrap(), vec![round, 1]);
        }
        assert!(ca.is_empty() && cb.is_empty());
    }

    #[test]
    fn responder_cannot_send_before_first_message() {
        let (_, mut bob) = pair();
        assert!(matches!(
            encrypt(&mut bob, b"x", AD_BA),
            Err(CryptoError::SessionError(_))
        ));
    }

    #[test]
    fn counters_after_first_exchange() {
        let (mut alice, mut bob) = pair();
        let m = encrypt(&mut alice, b"hi", AD_AB).unwrap();
        recv(&mut bob, &mut Vec::new(), &m, AD_AB).unwrap();

        assert_eq!((alice.ns, alice.nr), (1, 0));
        assert_eq!((bob.ns, bob.nr), (0, 1));
        assert_eq!(alice.sending_chain_key, bob.receiving_chain_key);
    }

    #[test]
    fn out_of_order_with_replay_protection() {
        let (mut alice, mut bob) = pair();
        let mut cache = Vec::new();
        let msgs: Vec<_> = (1..=5u8)
            .map(|i| encrypt(&mut alice, &[i], AD_AB).unwrap())
            .collect();

        for i in [3u8, 1, 5, 2, 4] {
            let msg = &msgs[usize::from(i) - 1];
            assert_eq!(recv(&mut bob, &mut cache, msg, AD_AB).unwrap(), vec![i]);
        }
        assert!(cache.is_empty());

        // Second delivery of M3: key already consumed.
        assert!(matches!(
            recv(&mut bob, &mut cache, &msgs[2], AD_AB),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn skipped_keys_survive_a_dh_ratchet() {
        let (mut alice, mut bob) = pair();
        let (mut ca, mut cb) = (Vec::new(), Vec::new());

        let a0 = encrypt(&mut alice, b"a0", AD_AB).unwrap();
        let a1 = encrypt(&mut alice, b"a1", AD_AB).unwrap();
        recv(&mut bob, &mut cb, &a0, AD_AB).unwrap();

        let b0 = encrypt(&mut bob, b"b0", AD_BA).unwrap();
        recv(&mut alice, &mut ca, &b0, AD_BA).unwrap();
        let a2 = encrypt(&mut alice, b"a2", AD_AB).unwrap();
        let a3 = encrypt(&mut alice, b"a3", AD_AB).unwrap();
        assert_eq!(a2.header.previous_chain_len, 2);

        // a3 first: skips a1 (old chain, via PN) and a2 (new chain).
        assert_eq!(recv(&mut bob, &mut cb, &a3, AD_AB).unwrap(), b"a3");
        assert_eq!(cb.len(), 2);
        assert_eq!(recv(&mut bob, &mut cb, &a1, AD_AB).unwrap(), b"a1");
        assert_eq!(recv(&mut bob, &mut cb, &a2, AD_AB).unwrap(), b"a2");
        assert!(cb.is_empty());
    }

    #[test]
    fn skip_bound_is_exclusive_at_max_skip() {
        let (mut alice, mut bob) = pair();
        let first = encrypt(&mut alice, b"first", AD_AB).unwrap();
        recv(&mut bob, &mut Vec::new(), &first, AD_AB).unwrap();

        // 1001 further messages the receiver never sees.
        let msgs: Vec<_> = (0..1001)
            .map(|_| encrypt(&mut alice, b"m", AD_AB).unwrap())
            .collect();

        let mut bob_a = bob.clone();
        assert_eq!(recv(&mut bob_a, &mut Vec::new(), &msgs[999], AD_AB).unwrap(), b"m");

        let before = bob.clone();
        let err = recv(&mut bob, &mut Vec::new(), &msgs[1000], AD_AB).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::TooManySkippedMessages { requested: 1000, limit: MAX_SKIP }
        ));
        assert_eq!(bob.nr, before.nr);
        assert_eq!(bob.receiving_chain_key, before.receiving_chain_key);
    }

    #[test]
    fn full_cache_evicts_oldest_keys() {
        let (mut alice, mut bob) = pair();
        let mut cache = Vec::new();
        let limit = 10;

        let first = encrypt(&mut alice, b"first", AD_AB).unwrap();
        recv_bounded(&mut bob, &mut cache, &first, AD_AB, limit).unwrap();
        let msgs: Vec<_> = (0..14u8)
            .map(|i| encrypt(&mut alice, &[i], AD_AB).unwrap())
            .collect();

        // 6 + 4 skipped keys fill the cache exactly.
        recv_bounded(&mut bob, &mut cache, &msgs[6], AD_AB, limit).unwrap();
        recv_bounded(&mut bob, &mut cache, &msgs[11], AD_AB, limit).unwrap();
        assert_eq!(cache.len(), 10);

        // One more skip pushes out the oldest key (msgs[0]).
        recv_bounded(&mut bob, &mut cache, &msgs[13], AD_AB, limit).unwrap();
        assert_eq!(cache.len(), 10);
        assert!(matches!(
            recv_bounded(&mut bob, &mut cache, &msgs[0], AD_AB, limit),
            Err(CryptoError::AuthenticationFailed)
        ));
        for i in [1usize, 12, 5, 7] {
            assert_eq!(
                recv_bounded(&mut bob, &mut cache, &msgs[i], AD_AB, limit).unwrap(),
                vec![u8::try_from(i).unwrap()]
            );
        }
    }

    #[test]
    fn one_decrypt_cannot_skip_past_the_bound() {
        let (mut alice, mut bob) = pair();
        let first = encrypt(&mut alice, b"first", AD_AB).unwrap();
        recv_bounded(&mut bob, &mut Vec::new(), &first, AD_AB, 10).unwrap();

        let msgs: Vec<_> = (0..11).map(|_| encrypt(&mut alice, b"m", AD_AB).unwrap()).collect();
        let mut working = bob.clone();
        assert!(matches!(
            decrypt(&mut working, &msgs[10], AD_AB, None, 0, 10),
            Err(CryptoError::TooManySkippedMessages { requested: 10, limit: 10 })
        ));
        let mut working = bob.clone();
        let out = decrypt(&mut working, &msgs[9], AD_AB, None, 5, 10).unwrap();
        assert_eq!((out.skipped.len(), out.evict), (9, 4));
    }

    #[test]
    fn tampering_fails_closed() {
        let (mut alice, bob) = pair();
        let m = encrypt(&mut alice, b"payload", AD_AB).unwrap();

        let mut ct = m.clone();
        ct.ciphertext[0] ^= 0x01;
        let mut nonce = m.clone();
        nonce.nonce[5] ^= 0x80;

        for (msg, ad) in [(&ct, AD_AB), (&nonce, AD_AB), (&m, AD_BA)] {
            let mut working = bob.clone();
            assert!(matches!(
                decrypt(&mut working, msg, ad, None, 0, MAX_SKIP),
                Err(CryptoError::AuthenticationFailed)
            ));
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        AliceSends,
        BobSends,
        DeliverToBob(usize),
        DeliverToAlice(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::AliceSends),
            Just(Step::BobSends),
            any::<usize>().prop_map(Step::DeliverToBob),
            any::<usize>().prop_map(Step::DeliverToAlice),
        ]
    }

    struct Side {
        session: Session,
        cache: Vec<SkippedMessageKey>,
        inbox: Vec<(EncryptedMessage, Vec<u8>)>,
        delivered: Vec<EncryptedMessage>,
        ad: &'static [u8],
    }

    impl Side {
        fn new(session: Session, ad: &'static [u8]) -> Self {
            Self {
                session,
                cache: Vec::new(),
                inbox: Vec::new(),
                delivered: Vec::new(),
                ad,
            }
        }

        fn deliver(&mut self, pick: usize) {
            if self.inbox.is_empty() {
                return;
            }
            let (msg, expected) = self.inbox.swap_remove(pick % self.inbox.len());
            let plaintext = recv(&mut self.session, &mut self.cache, &msg, self.ad).unwrap();
            assert_eq!(plaintext, expected);
            self.delivered.push(msg);
        }
    }

    /// Run a schedule, flush both inboxes, then check every delivered
    /// message is refused a second time.
    fn run_schedule(steps: &[Step]) {
        let (alice, bob) = pair();
        // `alice.inbox` holds Bob's messages and the other way round.
        let mut alice = Side::new(alice, AD_BA);
        let mut bob = Side::new(bob, AD_AB);
        let mut counter = 0u32;

        for step in steps {
            match *step {
                Step::AliceSends => {
                    let plaintext = counter.to_be_bytes().to_vec();
                    let msg = encrypt(&mut alice.session, &plaintext, AD_AB).unwrap();
                    bob.inbox.push((msg, plaintext));
                    counter += 1;
                }
                Step::BobSends if bob.session.sending_chain_key.is_some() => {
                    let plaintext = counter.to_be_bytes().to_vec();
                    let msg = encrypt(&mut bob.session, &plaintext, AD_BA).unwrap();
                    alice.inbox.push((msg, plaintext));
                    counter += 1;
                }
                Step::BobSends => {}
                Step::DeliverToBob(pick) => bob.deliver(pick),
                Step::DeliverToAlice(pick) => alice.deliver(pick),
            }
        }
        while !bob.inbox.is_empty() {
            bob.deliver(0);
        }
        while !alice.inbox.is_empty() {
            alice.deliver(0);
        }

        for side in [&mut alice, &mut bob] {
            assert!(side.cache.is_empty());
            for msg in side.delivered.clone() {
                assert!(recv(&mut side.session, &mut side.cache, &msg, side.ad).is_err());
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_interleaving_decrypts_exactly_once(
            steps in proptest::collection::vec(step(), 0..80),
        ) {
            run_schedule(&steps);
        }
    }
}
