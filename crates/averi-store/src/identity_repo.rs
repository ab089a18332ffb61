//! Persistence for the local identity and pinned peer identity keys.

use averi_crypto::{IdentityKeyPair, LocalIdentity};
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::Zeroizing;

use crate::db::timestamp_now;
use crate::error::{to_array, StoreError};

pub fn load_identity(conn: &Connection) -> Result<Option<LocalIdentity>, StoreError> {
    let row: Option<(String, Zeroizing<Vec<u8>>)> = conn
        .query_row("SELECT handle, secret_key FROM identity WHERE id = 1", [], |row| {
            Ok((row.get(0)?, Zeroizing::new(row.get(1)?)))
        })
        .optional()?;

    row.map(|(handle, secret)| {
        let secret = Zeroizing::new(to_array::<32>(&secret, "identity.secret_key")?);
        Ok(LocalIdentity::new(
            handle,
            IdentityKeyPair::from_secret_bytes(*secret),
        ))
    })
    .transpose()
}

pub fn save_identity(conn: &Connection, identity: &LocalIdentity) -> Result<(), StoreError> {
    let secret = Zeroizing::new(identity.keys.secret_bytes());
    conn.execute(
        "INSERT INTO identity (id, handle, secret_key) VALUES (1, ?1, ?2) \
         ON CONFLICT(id) DO UPDATE SET handle = excluded.handle, secret_key = excluded.secret_key",
        params![identity.handle, &secret[..]],
    )?;
    Ok(())
}

pub fn pinned_identity(conn: &Connection, handle: &str) -> Result<Option<[u8; 32]>, StoreError> {
    let key: Option<Vec<u8>> = conn
        .query_row(
            "SELECT identity_key FROM pinned_identity_keys WHERE handle = ?1",
            [handle],
            |row| row.get(0),
        )
        .optional()?;
    key.map(|k| to_array(&k, "pinned_identity_keys.identity_key"))
        .transpose()
}

pub fn pin_identity(conn: &Connection, handle: &str, key: &[u8; 32]) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO pinned_identity_keys (handle, identity_key, pinned_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(handle) DO UPDATE SET identity_key = excluded.identity_key, pinned_at = excluded.pinned_at",
        params![handle, &key[..], timestamp_now()],
    )?;
    Ok(())
}
