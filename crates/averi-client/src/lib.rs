//! Averi messaging client.
//!
//! Ties the protocol core and the local store to a key directory: bundle
//! lookup, trust-on-first-use pinning, the send/receive pipeline and the
//! encrypted local mailbox.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod provider;

pub use client::{Client, Delivery, EventOutcome, IdentityLookup, LocalMessage, ReceivedMessage};
pub use config::ClientConfig;
pub use envelope::{
    Attachment, ChatMessage, Forward, ForwardPayload, MessageEdit, MessageId, Payload, Receipt,
    ReceiptStatus, ServerEvent,
};
pub use error::ClientError;
pub use provider::{CachingProvider, FetchError, FetchMode, KeyBundleProvider, StaticDirectory};
