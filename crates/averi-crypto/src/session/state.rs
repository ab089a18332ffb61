use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::NONCE_LEN;

/// Durable row id of a session. Always positive so it fits an `SQLite` integer.
pub type SessionId = i64;

pub(crate) fn new_session_id() -> SessionId {
    OsRng.gen_range(1..i64::MAX)
}

/// Double Ratchet state for one peer.
///
/// A session is "awaiting first message" while `receiving_chain_key` and
/// `dhr` are both `None`, and "active" afterwards.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Session {
    #[zeroize(skip)]
    pub id: SessionId,
    #[zeroize(skip)]
    pub peer: String,
    #[zeroize(skip)]
    pub peer_identity: [u8; 32],
    pub root_key: [u8; 32],
    pub sending_chain_key: Option<[u8; 32]>,
    pub receiving_chain_key: Option<[u8; 32]>,
    pub dhs_secret: [u8; 32],
    #[zeroize(skip)]
    pub dhs_public: [u8; 32],
    #[zeroize(skip)]
    pub dhr: Option<[u8; 32]>,
    #[zeroize(skip)]
    pub ns: u32,
    #[zeroize(skip)]
    pub nr: u32,
    #[zeroize(skip)]
    pub pn: u32,
}

impl Session {
    /// Replace the local ratchet keypair.
    pub(crate) fn set_ratchet_keypair(&mut self, secret: &StaticSecret) {
        self.dhs_secret = secret.to_bytes();
        self.dhs_public = PublicKey::from(secret).to_bytes();
    }

    pub(crate) fn ratchet_secret(&self) -> StaticSecret {
        StaticSecret::from(self.dhs_secret)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("dhs_public", &hex::encode(self.dhs_public))
            .field("dhr", &self.dhr.map(hex::encode))
            .field("has_sending_chain", &self.sending_chain_key.is_some())
            .field("has_receiving_chain", &self.receiving_chain_key.is_some())
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .finish_non_exhaustive()
    }
}

/// Identifies a cached message key: `(session, sender ratchet key, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkippedKeyId {
    pub session_id: SessionId,
    pub dh_public_key: [u8; 32],
    pub index: u32,
}

/// A message key derived ahead of the receive position.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SkippedMessageKey {
    #[zeroize(skip)]
    pub id: SkippedKeyId,
    pub message_key: [u8; 32],
}

impl std::fmt::Debug for SkippedMessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkippedMessageKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub dh_public_key: [u8; 32],
    pub previous_chain_len: u32,
    pub message_number: u32,
}

/// A ratchet-encrypted message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Prekeys the initiator used, by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyIds {
    pub signed: u32,
    pub pq: u32,
    pub one_time: Option<u32>,
}

/// First message of a session: handshake material plus the first payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqxdhInit {
    pub id_key: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub pqkem_ciphertext: Vec<u8>,
    pub prekey_ids: PreKeyIds,
    pub initial_message: EncryptedMessage,
}

/// Anything a session can emit or consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    PqxdhInit(PqxdhInit),
    Message(EncryptedMessage),
}

/// Associated data bound into every AEAD call of a session, ordered
/// sender first: `IK_sender || IK_recipient || handle_sender || handle_recipient`.
pub fn associated_data(
    sender_identity: &[u8; 32],
    recipient_identity: &[u8; 32],
    sender_handle: &str,
    recipient_handle: &str,
) -> Vec<u8> {
    [
        &sender_identity[..],
        &recipient_identity[..],
        sender_handle.as_bytes(),
        recipient_handle.as_bytes(),
    ]
    .concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associated_data_is_plain_concatenation() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let ad = associated_data(&a, &b, "alice", "bob");
        assert_eq!(ad.len(), 72);
        assert_eq!(&ad[..32], &a);
        assert_eq!(&ad[32..64], &b);
        assert_eq!(&ad[64..], b"alicebob");

        assert_ne!(ad, associated_data(&b, &a, "bob", "alice"));
    }

    #[test]
    fn session_message_is_tagged() {
        let msg = SessionMessage::Message(EncryptedMessage {
            header: MessageHeader {
                dh_public_key: [3u8; 32],
                previous_chain_len: 0,
                message_number: 4,
            },
            ciphertext: vec![1, 2, 3],
            nonce: [0u8; NONCE_LEN],
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        let back: SessionMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn session_ids_are_positive() {
        for _ in 0..100 {
            assert!(new_session_id() > 0);
        }
    }

    #[test]
    fn debug_hides_key_material() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut session = Session {
            id: 1,
            peer: "bob".into(),
            peer_identity: [0u8; 32],
            root_key: [0xAB; 32],
            sending_chain_key: Some([0xCD; 32]),
            receiving_chain_key: None,
            dhs_secret: [0u8; 32],
            dhs_public: [0u8; 32],
            dhr: None,
            ns: 0,
            nr: 0,
            pn: 0,
        };
        session.set_ratchet_keypair(&secret);
        let rendered = format!("{session:?}");
        assert!(!rendered.contains(&hex::encode([0xAB; 32])));
        assert!(!rendered.contains(&hex::encode(session.dhs_secret)));
        assert_eq!(session.ratchet_secret().to_bytes(), secret.to_bytes());
    }
}
