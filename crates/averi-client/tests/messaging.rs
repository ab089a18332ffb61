//! End-to-end tests of the client pipeline.
//!
//! Real `SQLite` stores in temp directories and an in-process directory;
//! the only thing faked is the relay, which just rewrites the handle.

use std::future;
use std::path::Path;
use std::sync::Arc;

use averi_client::{
    ChatMessage, Client, ClientConfig, ClientError, EventOutcome, Forward, MessageEdit, Payload,
    Receipt, ReceiptStatus, ServerEvent, StaticDirectory,
};
use averi_crypto::{CryptoError, SessionMessage};
use averi_store::SqliteStore;
use tempfile::TempDir;

fn config() -> ClientConfig {
    ClientConfig {
        one_time_prekey_batch: 3,
        ..ClientConfig::default()
    }
}

fn register(dir: &Path, file: &str, handle: &str, directory: &Arc<StaticDirectory>) -> Client {
    let store = Arc::new(SqliteStore::open(dir.join(file)).expect("open store"));
    let (client, upload) =
        Client::register(store, Arc::clone(directory), config(), handle).expect("register");
    directory.publish(&upload).expect("publish");
    client
}

/// Send through the wire encoding and hand the result to `to`.
async fn exchange(from: &Client, to: &Client, text: &str) -> Forward {
    let forward = from
        .send_message(to.handle(), text.as_bytes(), future::pending())
        .await
        .expect("send");
    let wire = forward.to_bytes().unwrap();
    let delivered = Forward::from_bytes(&wire).unwrap().relayed_from(from.handle());
    let received = to.receive(&delivered).expect("receive");
    assert_eq!(received.from, from.handle());
    assert_eq!(received.plaintext, text.as_bytes());
    forward
}

// ── First contact ────────────────────────────────────────────────────

#[tokio::test]
async fn first_contact_then_conversation() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);

    let first = exchange(&alice, &bob, "hello bob").await;
    assert!(matches!(first.payload, SessionMessage::PqxdhInit(_)));
    assert_eq!(directory.remaining_one_time("bob"), Some((2, 2)));

    let reply = exchange(&bob, &alice, "hello alice").await;
    assert!(matches!(reply.payload, SessionMessage::Message(_)));
    exchange(&alice, &bob, "how are you").await;
    exchange(&alice, &bob, "still there?").await;
    exchange(&bob, &alice, "yes").await;

    // No further bundle fetches once the session exists.
    assert_eq!(directory.remaining_one_time("bob"), Some((2, 2)));
    assert_eq!(directory.remaining_one_time("alice"), Some((3, 3)));
}

#[tokio::test]
async fn out_of_order_delivery() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);
    exchange(&alice, &bob, "hi").await;

    let mut sent = Vec::new();
    for text in ["one", "two", "three"] {
        let forward = alice
            .send_message("bob", text.as_bytes(), future::pending())
            .await
            .unwrap();
        sent.push(forward.relayed_from("alice"));
    }

    for index in [2, 0, 1] {
        let received = bob.receive(&sent[index]).unwrap();
        assert_eq!(received.plaintext, ["one", "two", "three"][index].as_bytes());
    }
    // Each skipped key opens exactly one message.
    assert!(matches!(
        bob.receive(&sent[0]),
        Err(ClientError::Crypto(CryptoError::AuthenticationFailed))
    ));
}

// ── Bundle fetch ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_fetch_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let _bob = register(dir.path(), "bob.db", "bob", &directory);

    let result = alice.send_message("bob", b"hi", future::ready(())).await;
    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert!(!alice.sessions().has_session("bob").unwrap());
    assert_eq!(directory.remaining_one_time("bob"), Some((3, 3)));

    let result = alice.lookup_identity("bob", future::ready(())).await;
    assert!(matches!(result, Err(ClientError::Cancelled)));
}

#[tokio::test]
async fn unknown_recipient_is_bundle_not_found() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);

    let result = alice.send_message("carol", b"hi", future::pending()).await;
    assert!(matches!(result, Err(ClientError::BundleNotFound(h)) if h == "carol"));
    assert!(!alice.sessions().has_session("carol").unwrap());
}

#[tokio::test]
async fn dry_run_lookup_does_not_consume_prekeys() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);

    let lookup = alice.lookup_identity("bob", future::pending()).await.unwrap();
    assert_eq!(lookup.identity_key, bob.identity().keys.public_key_bytes());
    assert_eq!(lookup.presented_fingerprint, bob.identity().keys.fingerprint());
    assert_eq!(lookup.pinned_fingerprint, None);
    assert!(lookup.matches_pin());
    assert_eq!(directory.remaining_one_time("bob"), Some((3, 3)));

    exchange(&alice, &bob, "hi").await;
    let lookup = alice.lookup_identity("bob", future::pending()).await.unwrap();
    assert_eq!(lookup.pinned_fingerprint, Some(lookup.presented_fingerprint.clone()));
}

// ── Trust ────────────────────────────────────────────────────────────

#[tokio::test]
async fn changed_identity_is_refused_until_trusted() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);
    exchange(&alice, &bob, "hi").await;
    exchange(&bob, &alice, "hi back").await;

    // Bob reinstalls: same handle, new identity key.
    let new_bob = register(dir.path(), "bob-new.db", "bob", &directory);
    let handshake = new_bob
        .send_message("alice", b"it's me, new phone", future::pending())
        .await
        .unwrap()
        .relayed_from("bob");

    let err = alice.receive(&handshake).unwrap_err();
    let ClientError::Crypto(CryptoError::KeyMismatch {
        handle,
        pinned_fingerprint,
        presented_fingerprint,
    }) = err
    else {
        panic!("expected KeyMismatch, got {err:?}");
    };
    assert_eq!(handle, "bob");
    assert_eq!(pinned_fingerprint, bob.identity().keys.fingerprint());
    assert_eq!(presented_fingerprint, new_bob.identity().keys.fingerprint());

    let lookup = alice.lookup_identity("bob", future::pending()).await.unwrap();
    assert!(!lookup.matches_pin());

    alice.trust_identity("bob", &lookup.identity_key).unwrap();
    let received = alice.receive(&handshake).unwrap();
    assert_eq!(received.plaintext, b"it's me, new phone");

    // The old session was replaced; replies reach the new install.
    exchange(&alice, &new_bob, "welcome back").await;
}

// ── Chat payloads ────────────────────────────────────────────────────

fn text_message(id: u64, text: &str) -> Payload {
    Payload::MsgNew(ChatMessage {
        id,
        text: Some(text.to_string()),
        reply_to: None,
        timestamp: 1_700_000_000_000 + id,
        attachments: Vec::new(),
    })
}

#[tokio::test]
async fn new_and_edited_messages_are_acknowledged() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);

    // First contact carries the payload inside the handshake.
    let first = alice
        .send_payload("bob", &text_message(0, "hi"), future::pending())
        .await
        .unwrap();
    let delivery = bob.receive_payload(&first.relayed_from("alice")).unwrap();
    assert_eq!(delivery.from, "alice");
    assert_eq!(delivery.payload, text_message(0, "hi"));

    let receipt = delivery.receipt.expect("automatic receipt").relayed_from("bob");
    let ack = alice.receive_payload(&receipt).unwrap();
    assert_eq!(
        ack.payload,
        Payload::Receipt(Receipt {
            id: 0,
            status: ReceiptStatus::Received
        })
    );
    assert!(ack.receipt.is_none());

    let edit = Payload::MsgEdit(MessageEdit {
        id: 0,
        text: Some("hi there".into()),
        timestamp: 1_700_000_000_500,
        attachment_ids: Vec::new(),
    });
    let sent = alice.send_payload("bob", &edit, future::pending()).await.unwrap();
    let delivery = bob.receive_payload(&sent.relayed_from("alice")).unwrap();
    assert_eq!(delivery.payload, edit);
    let ack = alice
        .receive_payload(&delivery.receipt.unwrap().relayed_from("bob"))
        .unwrap();
    assert!(matches!(
        ack.payload,
        Payload::Receipt(Receipt {
            id: 0,
            status: ReceiptStatus::Received
        })
    ));

    let delete = Payload::MsgDelete { id: 0 };
    let sent = alice.send_payload("bob", &delete, future::pending()).await.unwrap();
    let delivery = bob.receive_payload(&sent.relayed_from("alice")).unwrap();
    assert_eq!(delivery.payload, delete);
    assert!(delivery.receipt.is_none());

    // Bob opens the conversation: an explicit "seen" receipt.
    let seen = Payload::Receipt(Receipt {
        id: 0,
        status: ReceiptStatus::Seen,
    });
    let sent = bob.send_payload("alice", &seen, future::pending()).await.unwrap();
    assert_eq!(
        alice.receive_payload(&sent.relayed_from("bob")).unwrap().payload,
        seen
    );
}

#[tokio::test]
async fn raw_bytes_are_not_a_payload() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);

    let sent = alice
        .send_message("bob", b"not json", future::pending())
        .await
        .unwrap();
    assert!(matches!(
        bob.receive_payload(&sent.relayed_from("alice")),
        Err(ClientError::Codec(_))
    ));
    // The handshake itself went through.
    assert!(bob.sessions().has_session("alice").unwrap());
}

// ── Server events ────────────────────────────────────────────────────

#[tokio::test]
async fn low_on_keys_replenishes_the_directory() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    let bob = register(dir.path(), "bob.db", "bob", &directory);

    let event = ServerEvent::from_bytes(br#"{"type":"low_on_keys"}"#).unwrap();
    let EventOutcome::Replenished(patch) = bob.handle_server_event(&event).unwrap() else {
        panic!("expected a replenish patch");
    };
    assert_eq!(patch.one_time_prekeys.len(), 3);
    assert_eq!(patch.pq_one_time_prekeys.len(), 3);
    assert!(patch.signed_prekey.is_none());
    directory.apply_patch("bob", &patch).unwrap();
    assert_eq!(directory.remaining_one_time("bob"), Some((6, 6)));

    let forward = alice
        .send_payload("bob", &text_message(1, "via event"), future::pending())
        .await
        .unwrap()
        .relayed_from("alice");
    let EventOutcome::Message(delivery) =
        bob.handle_server_event(&ServerEvent::Forward(forward)).unwrap()
    else {
        panic!("expected a message");
    };
    assert_eq!(delivery.payload, text_message(1, "via event"));
    assert!(delivery.receipt.is_some());
}

#[tokio::test]
async fn stale_prekeys_rotate() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let bob = register(dir.path(), "bob.db", "bob", &directory);
    assert!(bob.rotate_prekeys().unwrap().is_none());

    let store = Arc::new(SqliteStore::open(dir.path().join("bob.db")).unwrap());
    let eager = ClientConfig {
        signed_prekey_max_age_days: 0,
        ..config()
    };
    let bob = Client::open(store, Arc::clone(&directory), eager).unwrap();
    let patch = bob.rotate_prekeys().unwrap().expect("rotation due");
    assert!(patch.signed_prekey.is_some());
    assert!(patch.pq_prekey.is_some());
    directory.apply_patch("bob", &patch).unwrap();

    // Handshakes against the rotated keys still work.
    let alice = register(dir.path(), "alice.db", "alice", &directory);
    exchange(&alice, &bob, "after rotation").await;
}

// ── Local mailbox ────────────────────────────────────────────────────

#[tokio::test]
async fn local_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(StaticDirectory::new());
    let alice = register(dir.path(), "alice.db", "alice", &directory);

    alice.store_local("bob", "alice", b"first").unwrap();
    alice.store_local("bob", "bob", b"second").unwrap();
    alice.store_local("carol", "carol", b"elsewhere").unwrap();
    drop(alice);

    let store = Arc::new(SqliteStore::open(dir.path().join("alice.db")).unwrap());
    let alice = Client::open(store, Arc::clone(&directory), config()).unwrap();
    let history = alice.load_local("bob").unwrap();
    let texts: Vec<_> = history.iter().map(|m| m.plaintext.as_slice()).collect();
    assert_eq!(texts, [b"first".as_slice(), b"second".as_slice()]);
    assert_eq!(history[1].sender, "bob");
    assert_eq!(alice.load_local("carol").unwrap().len(), 1);
}

#[test]
fn open_without_identity_fails() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let result = Client::open(store, StaticDirectory::new(), config());
    assert!(matches!(
        result,
        Err(ClientError::Crypto(CryptoError::NoIdentity))
    ));
}
