//! The messaging pipeline: identity, sessions, trust and the local mailbox.

use std::future::Future;
use std::sync::Arc;

use averi_crypto::session::prekeys::{register, replenish, rotate_if_stale};
use averi_crypto::session::StoredMessage;
use averi_crypto::{
    fingerprint, CryptoError, IdentityPatch, IdentityUpload, KeyBundle, LocalIdentity, LocalKey,
    ProtocolStore, SessionManager, SessionMessage,
};
use averi_store::timestamp_now;

use crate::config::ClientConfig;
use crate::envelope::{Forward, Payload, ServerEvent};
use crate::error::ClientError;
use crate::provider::{FetchMode, KeyBundleProvider};

/// A decrypted message from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from: String,
    pub plaintext: Vec<u8>,
}

/// A decoded chat payload from a peer.
#[derive(Debug)]
pub struct Delivery {
    pub from: String,
    pub payload: Payload,
    /// Encrypted "received" receipt to relay back, for new and edited
    /// messages.
    pub receipt: Option<Forward>,
}

/// What handling a server push produced.
#[derive(Debug)]
pub enum EventOutcome {
    Message(Delivery),
    /// New one-time prekeys to upload to the directory.
    Replenished(IdentityPatch),
}

/// Result of a dry-run identity lookup, for safety-number display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLookup {
    pub handle: String,
    pub identity_key: [u8; 32],
    pub presented_fingerprint: String,
    /// `None` before first contact.
    pub pinned_fingerprint: Option<String>,
}

impl IdentityLookup {
    /// True when nothing is pinned yet or the pin matches.
    pub fn matches_pin(&self) -> bool {
        self.pinned_fingerprint
            .as_ref()
            .is_none_or(|pinned| *pinned == self.presented_fingerprint)
    }
}

/// A message from the local mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub sender: String,
    pub plaintext: Vec<u8>,
    pub timestamp: u64,
}

pub struct Client {
    identity: LocalIdentity,
    store: Arc<dyn ProtocolStore>,
    sessions: SessionManager,
    provider: Box<dyn KeyBundleProvider>,
    local_key: LocalKey,
    config: ClientConfig,
}

impl Client {
    /// Create a new identity in `store`. The returned upload goes to the
    /// directory.
    pub fn register(
        store: Arc<dyn ProtocolStore>,
        provider: impl KeyBundleProvider + 'static,
        config: ClientConfig,
        handle: &str,
    ) -> Result<(Self, IdentityUpload), ClientError> {
        let (identity, upload) = register(
            store.as_ref(),
            handle,
            config.one_time_prekey_batch,
            timestamp_now(),
        )?;
        tracing::info!(handle, fingerprint = %identity.keys.fingerprint(), "registered identity");
        let client = Self::with_identity(identity, store, provider, config)?;
        Ok((client, upload))
    }

    /// Open the identity already persisted in `store`.
    pub fn open(
        store: Arc<dyn ProtocolStore>,
        provider: impl KeyBundleProvider + 'static,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let identity = store.load_identity()?.ok_or(CryptoError::NoIdentity)?;
        tracing::debug!(handle = %identity.handle, "opened identity");
        Self::with_identity(identity, store, provider, config)
    }

    fn with_identity(
        identity: LocalIdentity,
        store: Arc<dyn ProtocolStore>,
        provider: impl KeyBundleProvider + 'static,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let local_key = LocalKey::derive(&identity.keys)?;
        let sessions = SessionManager::new(Arc::clone(&store), config.max_skip);
        Ok(Self {
            identity,
            store,
            sessions,
            provider: Box::new(provider),
            local_key,
            config,
        })
    }

    pub fn handle(&self) -> &str {
        &self.identity.handle
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Encrypt `plaintext` for `to`.
    ///
    /// Without a session this fetches a bundle and runs the handshake. The
    /// fetch is abandoned, with nothing persisted, if `cancel` resolves
    /// first.
    pub async fn send_message(
        &self,
        to: &str,
        plaintext: &[u8],
        cancel: impl Future<Output = ()>,
    ) -> Result<Forward, ClientError> {
        if self.sessions.has_session(to)? {
            return self.encrypt_for(to, plaintext);
        }

        let bundle = self.fetch_bundle(to, FetchMode::Consume, cancel).await?;
        let payload = self.sessions.initiate(&self.identity, &bundle, plaintext)?;
        if matches!(payload, SessionMessage::PqxdhInit(_)) {
            tracing::info!(peer = to, "started session");
        }
        Ok(Forward {
            handle: to.to_string(),
            payload,
        })
    }

    /// Encode `payload` and send it like [`Client::send_message`].
    pub async fn send_payload(
        &self,
        to: &str,
        payload: &Payload,
        cancel: impl Future<Output = ()>,
    ) -> Result<Forward, ClientError> {
        self.send_message(to, &payload.to_bytes()?, cancel).await
    }

    fn encrypt_for(&self, to: &str, plaintext: &[u8]) -> Result<Forward, ClientError> {
        let message = self.sessions.encrypt(&self.identity, to, plaintext)?;
        Ok(Forward {
            handle: to.to_string(),
            payload: SessionMessage::Message(message),
        })
    }

    /// Decrypt a delivered message; `forward.handle` is the sender.
    pub fn receive(&self, forward: &Forward) -> Result<ReceivedMessage, ClientError> {
        let plaintext = self
            .sessions
            .receive(&self.identity, &forward.handle, &forward.payload)
            .inspect_err(|e| {
                tracing::warn!(peer = %forward.handle, error = %e, "dropping undecryptable message");
            })?;
        Ok(ReceivedMessage {
            from: forward.handle.clone(),
            plaintext,
        })
    }

    /// Decrypt and decode a chat payload, preparing the automatic receipt
    /// over the session the message arrived on.
    pub fn receive_payload(&self, forward: &Forward) -> Result<Delivery, ClientError> {
        let received = self.receive(forward)?;
        let payload = Payload::from_bytes(&received.plaintext).inspect_err(|e| {
            tracing::warn!(peer = %received.from, error = %e, "undecodable payload");
        })?;
        let receipt = payload
            .receipt_due()
            .map(|receipt| self.encrypt_for(&received.from, &Payload::Receipt(receipt).to_bytes()?))
            .transpose()?;
        Ok(Delivery {
            from: received.from,
            payload,
            receipt,
        })
    }

    pub fn handle_server_event(&self, event: &ServerEvent) -> Result<EventOutcome, ClientError> {
        match event {
            ServerEvent::Forward(forward) => self.receive_payload(forward).map(EventOutcome::Message),
            ServerEvent::LowOnKeys => self.replenish_prekeys().map(EventOutcome::Replenished),
        }
    }

    /// Look up the identity key `handle` currently publishes, without
    /// consuming prekeys, and compare it with the pin.
    pub async fn lookup_identity(
        &self,
        handle: &str,
        cancel: impl Future<Output = ()>,
    ) -> Result<IdentityLookup, ClientError> {
        let bundle = self.fetch_bundle(handle, FetchMode::DryRun, cancel).await?;
        bundle.verify()?;
        let identity_key = bundle.identity_key_array()?;
        let pinned = self.store.pinned_identity(handle)?;
        Ok(IdentityLookup {
            handle: handle.to_string(),
            identity_key,
            presented_fingerprint: fingerprint(&identity_key),
            pinned_fingerprint: pinned.map(|key| fingerprint(&key)),
        })
    }

    /// Accept a changed identity key for `handle`.
    pub fn trust_identity(&self, handle: &str, identity_key: &[u8; 32]) -> Result<(), ClientError> {
        Ok(self.sessions.trust_identity(handle, identity_key)?)
    }

    /// Rotate the signed and last-resort PQ prekeys if they are older than
    /// the configured age.
    pub fn rotate_prekeys(&self) -> Result<Option<IdentityPatch>, ClientError> {
        Ok(rotate_if_stale(
            self.store.as_ref(),
            &self.identity,
            self.config.signed_prekey_max_age_secs(),
            timestamp_now(),
        )?)
    }

    pub fn replenish_prekeys(&self) -> Result<IdentityPatch, ClientError> {
        Ok(replenish(
            self.store.as_ref(),
            &self.identity,
            self.config.one_time_prekey_batch,
            timestamp_now(),
        )?)
    }

    /// Encrypt a plaintext at rest in the conversation with `peer`.
    pub fn store_local(&self, peer: &str, sender: &str, plaintext: &[u8]) -> Result<(), ClientError> {
        let message = StoredMessage {
            sender: sender.to_string(),
            entry: self.local_key.encrypt(plaintext)?,
            timestamp: timestamp_now(),
        };
        Ok(self.store.append_message(peer, &message)?)
    }

    /// The conversation with `peer`, oldest first.
    pub fn load_local(&self, peer: &str) -> Result<Vec<LocalMessage>, ClientError> {
        self.store
            .load_messages(peer)?
            .into_iter()
            .map(|stored| {
                Ok(LocalMessage {
                    plaintext: self.local_key.decrypt(&stored.entry)?,
                    sender: stored.sender,
                    timestamp: stored.timestamp,
                })
            })
            .collect()
    }

    async fn fetch_bundle(
        &self,
        handle: &str,
        mode: FetchMode,
        cancel: impl Future<Output = ()>,
    ) -> Result<KeyBundle, ClientError> {
        let bundle = tokio::select! {
            biased;
            () = cancel => {
                tracing::debug!(handle, ?mode, "bundle fetch cancelled");
                return Err(ClientError::Cancelled);
            }
            fetched = self.provider.fetch(handle, mode) => fetched?,
        };
        if bundle.handle != handle {
            return Err(ClientError::BundleFetch(format!(
                "asked for {handle}, directory returned {}",
                bundle.handle
            )));
        }
        Ok(bundle)
    }
}
