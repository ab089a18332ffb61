//! Persistence for our prekeys and the key id counter.

use averi_crypto::session::{OneTimePreKeyRecord, PqPreKeyRecord, PreKeyBatch, SignedPreKeyRecord};
use averi_crypto::KemKeyPair;
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::Zeroizing;

use crate::error::{to_array, StoreError};

const NEXT_KEY_ID: &str = "next_key_id";

/// Reserve `count` ids. Must run inside a transaction.
pub fn allocate_key_ids(conn: &Connection, count: u32) -> Result<u32, StoreError> {
    let first: u32 = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [NEXT_KEY_ID],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = first
        .checked_add(count)
        .ok_or_else(|| StoreError::corrupt("metadata.next_key_id", "key id space exhausted"))?;
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![NEXT_KEY_ID, next],
    )?;
    Ok(first)
}

/// Insert a batch. Must run inside a transaction.
pub fn store_prekeys(conn: &Connection, batch: &PreKeyBatch) -> Result<(), StoreError> {
    let mut signed = conn.prepare(
        "INSERT INTO signed_prekeys (id, secret_key, signature, created_at) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for record in &batch.signed {
        let secret = Zeroizing::new(record.secret_bytes());
        signed.execute(params![record.id, &secret[..], record.signature, record.created_at])?;
    }

    let mut pq = conn.prepare(
        "INSERT INTO pq_prekeys (id, public_key, secret_key, signature, one_time, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for record in &batch.pq {
        pq.execute(params![
            record.id,
            record.keys.public_bytes(),
            record.keys.secret_bytes(),
            record.signature,
            record.one_time,
            record.created_at
        ])?;
    }

    let mut one_time =
        conn.prepare("INSERT INTO one_time_prekeys (id, secret_key) VALUES (?1, ?2)")?;
    for record in &batch.one_time {
        let secret = Zeroizing::new(record.secret_bytes());
        one_time.execute(params![record.id, &secret[..]])?;
    }
    Ok(())
}

pub fn load_signed_prekey(
    conn: &Connection,
    id: u32,
) -> Result<Option<SignedPreKeyRecord>, StoreError> {
    let row: Option<(Zeroizing<Vec<u8>>, Vec<u8>, u64)> = conn
        .query_row(
            "SELECT secret_key, signature, created_at FROM signed_prekeys WHERE id = ?1",
            [id],
            |row| Ok((Zeroizing::new(row.get(0)?), row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(secret, signature, created_at)| {
        let secret = to_array(&secret, "signed_prekeys.secret_key")?;
        Ok(SignedPreKeyRecord::from_parts(id, secret, signature, created_at))
    })
    .transpose()
}

pub fn load_pq_prekey(conn: &Connection, id: u32) -> Result<Option<PqPreKeyRecord>, StoreError> {
    let row: Option<(Vec<u8>, Zeroizing<Vec<u8>>, Vec<u8>, bool, u64)> = conn
        .query_row(
            "SELECT public_key, secret_key, signature, one_time, created_at FROM pq_prekeys WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get(0)?,
                    Zeroizing::new(row.get(1)?),
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;
    row.map(|(public, secret, signature, one_time, created_at)| {
        let keys = KemKeyPair::from_bytes(&public, &secret)
            .map_err(|e| StoreError::corrupt("pq_prekeys.secret_key", e.to_string()))?;
        Ok(PqPreKeyRecord {
            id,
            keys,
            signature,
            one_time,
            created_at,
        })
    })
    .transpose()
}

pub fn load_one_time_prekey(
    conn: &Connection,
    id: u32,
) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
    let secret: Option<Zeroizing<Vec<u8>>> = conn
        .query_row(
            "SELECT secret_key FROM one_time_prekeys WHERE id = ?1",
            [id],
            |row| row.get(0).map(Zeroizing::new),
        )
        .optional()?;
    secret
        .map(|s| {
            let secret = to_array(&s, "one_time_prekeys.secret_key")?;
            Ok(OneTimePreKeyRecord::from_secret(id, secret))
        })
        .transpose()
}

pub fn newest_signed_prekey_at(conn: &Connection) -> Result<Option<u64>, StoreError> {
    Ok(conn.query_row("SELECT MAX(created_at) FROM signed_prekeys", [], |row| {
        row.get(0)
    })?)
}

pub fn newest_last_resort_pq_prekey_at(conn: &Connection) -> Result<Option<u64>, StoreError> {
    Ok(conn.query_row(
        "SELECT MAX(created_at) FROM pq_prekeys WHERE one_time = 0",
        [],
        |row| row.get(0),
    )?)
}

pub fn delete_one_time_prekey(conn: &Connection, id: u32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM one_time_prekeys WHERE id = ?1", [id])?;
    Ok(())
}

pub fn delete_pq_prekey(conn: &Connection, id: u32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM pq_prekeys WHERE id = ?1 AND one_time = 1", [id])?;
    Ok(())
}

pub fn count_one_time_prekeys(conn: &Connection) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM one_time_prekeys", [], |row| row.get(0))?;
    usize::try_from(n).map_err(|e| StoreError::corrupt("one_time_prekeys", e.to_string()))
}
