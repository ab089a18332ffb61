//! Encrypted mailbox persistence.
//!
//! Rows hold ciphertext sealed under the device-local key; plaintext never
//! reaches the database.

use averi_crypto::session::StoredMessage;
use averi_crypto::EncryptedMailboxEntry;
use rusqlite::{params, Connection};

use crate::error::{to_array, StoreError};

pub fn insert_message(
    conn: &Connection,
    peer: &str,
    message: &StoredMessage,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO messages (peer, sender, ciphertext, nonce, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            peer,
            message.sender,
            message.entry.ciphertext,
            &message.entry.nonce[..],
            message.timestamp
        ],
    )?;
    Ok(())
}

/// Conversation with `peer`, oldest first.
pub fn load_conversation(conn: &Connection, peer: &str) -> Result<Vec<StoredMessage>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT sender, ciphertext, nonce, timestamp FROM messages WHERE peer = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([peer], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, u64>(3)?,
        ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
        let (sender, ciphertext, nonce, timestamp) = row?;
        messages.push(StoredMessage {
            sender,
            entry: EncryptedMailboxEntry {
                ciphertext,
                nonce: to_array(&nonce, "messages.nonce")?,
            },
            timestamp,
        });
    }
    Ok(messages)
}
