//! Wire types: what the relay server sees, and the chat payload carried
//! end-to-end inside each session message.

use averi_crypto::SessionMessage;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// The payload of a [`Forward`]: a handshake or a ratchet message.
pub type ForwardPayload = SessionMessage;

/// A message routed through the server.
///
/// Outbound, `handle` names the recipient; the server rewrites it to the
/// sender before delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub handle: String,
    pub payload: ForwardPayload,
}

impl Forward {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClientError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The same payload as delivered to the recipient, from `sender`.
    pub fn relayed_from(self, sender: &str) -> Self {
        Self {
            handle: sender.to_string(),
            payload: self.payload,
        }
    }
}

/// Server pushes the client reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Forward(Forward),
    /// The server is running out of our one-time prekeys.
    LowOnKeys,
}

impl ServerEvent {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Sender-chosen id of a chat message, unique per conversation and sender.
pub type MessageId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A new chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: Option<String>,
    pub reply_to: Option<MessageId>,
    /// Milliseconds since the UNIX epoch, sender clock.
    pub timestamp: u64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Replace the text of an earlier message and drop some of its attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub id: MessageId,
    pub text: Option<String>,
    pub timestamp: u64,
    /// Attachments removed by the edit.
    #[serde(default)]
    pub attachment_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Received,
    Seen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: MessageId,
    pub status: ReceiptStatus,
}

/// The plaintext of every session message between clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    MsgNew(ChatMessage),
    MsgEdit(MessageEdit),
    MsgDelete { id: MessageId },
    Receipt(Receipt),
}

impl Payload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClientError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The receipt a recipient sends back on decrypt, if any. New and
    /// edited messages are acknowledged; deletes and receipts are not.
    pub fn receipt_due(&self) -> Option<Receipt> {
        let id = match self {
            Self::MsgNew(message) => message.id,
            Self::MsgEdit(edit) => edit.id,
            Self::MsgDelete { .. } | Self::Receipt(_) => return None,
        };
        Some(Receipt {
            id,
            status: ReceiptStatus::Received,
        })
    }
}
