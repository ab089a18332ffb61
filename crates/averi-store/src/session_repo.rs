//! Persistence for ratchet sessions and skipped message keys.

use averi_crypto::primitives::x25519_public;
use averi_crypto::session::{RatchetCommit, Session, SessionId, SkippedKeyId};
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::db::timestamp_now;
use crate::error::{to_array, StoreError};
use crate::{identity_repo, prekey_repo};

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionRow {
    #[zeroize(skip)]
    id: SessionId,
    #[zeroize(skip)]
    peer_identity: Vec<u8>,
    root_key: Vec<u8>,
    sending_chain_key: Option<Vec<u8>>,
    receiving_chain_key: Option<Vec<u8>>,
    dhs_secret: Vec<u8>,
    #[zeroize(skip)]
    dhr: Option<Vec<u8>>,
    #[zeroize(skip)]
    counters: (u32, u32, u32),
}

impl SessionRow {
    fn into_session(self, peer: &str) -> Result<Session, StoreError> {
        let optional_key = |blob: &Option<Vec<u8>>, column| {
            blob.as_deref().map(|b| to_array::<32>(b, column)).transpose()
        };
        let dhs_secret = to_array::<32>(&self.dhs_secret, "sessions.dhs_secret")?;
        let (ns, nr, pn) = self.counters;
        let mut session = Session {
            id: self.id,
            peer: peer.to_string(),
            peer_identity: to_array(&self.peer_identity, "sessions.peer_identity")?,
            root_key: to_array(&self.root_key, "sessions.root_key")?,
            sending_chain_key: optional_key(&self.sending_chain_key, "sessions.sending_chain_key")?,
            receiving_chain_key: optional_key(
                &self.receiving_chain_key,
                "sessions.receiving_chain_key",
            )?,
            dhs_secret,
            dhs_public: [0u8; 32],
            dhr: optional_key(&self.dhr, "sessions.dhr")?,
            ns,
            nr,
            pn,
        };
        session.dhs_public = x25519_public(&dhs_secret);
        Ok(session)
    }
}

pub fn load_session(conn: &Connection, peer: &str) -> Result<Option<Session>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, peer_identity, root_key, sending_chain_key, receiving_chain_key, \
             dhs_secret, dhr, ns, nr, pn FROM sessions WHERE peer = ?1",
            [peer],
            |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    peer_identity: row.get(1)?,
                    root_key: row.get(2)?,
                    sending_chain_key: row.get(3)?,
                    receiving_chain_key: row.get(4)?,
                    dhs_secret: row.get(5)?,
                    dhr: row.get(6)?,
                    counters: (row.get(7)?, row.get(8)?, row.get(9)?),
                })
            },
        )
        .optional()?;
    row.map(|r| r.into_session(peer)).transpose()
}

pub fn load_skipped_key(
    conn: &Connection,
    id: &SkippedKeyId,
) -> Result<Option<[u8; 32]>, StoreError> {
    let key: Option<Vec<u8>> = conn
        .query_row(
            "SELECT message_key FROM skipped_message_keys \
             WHERE session_id = ?1 AND dh_public_key = ?2 AND message_index = ?3",
            params![id.session_id, &id.dh_public_key[..], id.index],
            |row| row.get(0),
        )
        .optional()?;
    key.map(|mut k| {
        let key = to_array(&k, "skipped_message_keys.message_key");
        k.zeroize();
        key
    })
    .transpose()
}

pub fn handshake_seen(
    conn: &Connection,
    peer: &str,
    ephemeral_key: &[u8; 32],
) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM seen_handshakes WHERE peer = ?1 AND ephemeral_key = ?2",
            params![peer, &ephemeral_key[..]],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub fn count_skipped_keys(conn: &Connection, session_id: SessionId) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM skipped_message_keys WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    usize::try_from(n).map_err(|e| StoreError::corrupt("skipped_message_keys", e.to_string()))
}

/// Apply a ratchet commit. Must run inside a transaction.
pub fn apply_commit(conn: &Connection, commit: &RatchetCommit) -> Result<(), StoreError> {
    let s = &commit.session;

    // Any other session row for this peer is being replaced; its skipped
    // keys go with it (ON DELETE CASCADE).
    let replaced = conn.execute(
        "DELETE FROM sessions WHERE peer = ?1 AND id != ?2",
        params![s.peer, s.id],
    )?;
    if let Some(old) = commit.replaced_session {
        conn.execute("DELETE FROM sessions WHERE id = ?1", [old])?;
    }
    if replaced > 0 {
        tracing::debug!(peer = %s.peer, "purged replaced session");
    }

    conn.execute(
        "INSERT INTO sessions (id, peer, peer_identity, root_key, sending_chain_key, \
         receiving_chain_key, dhs_secret, dhr, ns, nr, pn) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(id) DO UPDATE SET \
         root_key = excluded.root_key, \
         sending_chain_key = excluded.sending_chain_key, \
         receiving_chain_key = excluded.receiving_chain_key, \
         dhs_secret = excluded.dhs_secret, \
         dhr = excluded.dhr, \
         ns = excluded.ns, nr = excluded.nr, pn = excluded.pn",
        params![
            s.id,
            s.peer,
            &s.peer_identity[..],
            &s.root_key[..],
            s.sending_chain_key.as_ref().map(|k| &k[..]),
            s.receiving_chain_key.as_ref().map(|k| &k[..]),
            &s.dhs_secret[..],
            s.dhr.as_ref().map(|k| &k[..]),
            s.ns,
            s.nr,
            s.pn
        ],
    )?;

    if let Some(id) = &commit.consumed_skipped_key {
        conn.execute(
            "DELETE FROM skipped_message_keys \
             WHERE session_id = ?1 AND dh_public_key = ?2 AND message_index = ?3",
            params![id.session_id, &id.dh_public_key[..], id.index],
        )?;
    }

    if commit.evicted_skipped_keys > 0 {
        let evict = i64::try_from(commit.evicted_skipped_keys).unwrap_or(i64::MAX);
        let n = conn.execute(
            "DELETE FROM skipped_message_keys WHERE rowid IN ( \
             SELECT rowid FROM skipped_message_keys WHERE session_id = ?1 \
             ORDER BY rowid LIMIT ?2)",
            params![s.id, evict],
        )?;
        tracing::debug!(peer = %s.peer, evicted = n, "evicted oldest skipped keys");
    }

    let mut insert = conn.prepare(
        "INSERT INTO skipped_message_keys (session_id, dh_public_key, message_index, message_key) \
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for key in &commit.skipped_keys {
        insert.execute(params![
            key.id.session_id,
            &key.id.dh_public_key[..],
            key.id.index,
            &key.message_key[..]
        ])?;
    }

    if let Some(id) = commit.consumed_one_time_prekey {
        prekey_repo::delete_one_time_prekey(conn, id)?;
    }
    if let Some(id) = commit.consumed_pq_prekey {
        prekey_repo::delete_pq_prekey(conn, id)?;
    }
    if let Some(key) = &commit.pin {
        identity_repo::pin_identity(conn, &s.peer, key)?;
    }
    if let Some(ephemeral) = &commit.accepted_handshake {
        conn.execute(
            "INSERT INTO seen_handshakes (peer, ephemeral_key, seen_at) VALUES (?1, ?2, ?3)",
            params![s.peer, &ephemeral[..], timestamp_now()],
        )?;
    }
    Ok(())
}
