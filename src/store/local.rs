//! # LocalKeyStore
//!
//! Persistent on-device cache: identity keys, session keys (with their
//! monotonic message counters), and a cache of historical public keys.
//! Backed by SQLite via `rusqlite`, following the same connection-wrapping
//! and error-mapping pattern as the rest of this crate's storage layer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        LOCAL KEY STORE TABLES                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  identity_keys      PK user_id              { public_key, secret_key } │
//! │  session_keys       PK (conversation_id,     { session_key, counter }  │
//! │                         epoch)                                         │
//! │  historical_keys    PK (user_id, epoch)      { public_key }           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::error::{Error, Result};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id    TEXT PRIMARY KEY,
    public_key BLOB NOT NULL,
    secret_key BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_keys (
    conversation_id TEXT NOT NULL,
    epoch           INTEGER NOT NULL,
    session_key     BLOB NOT NULL,
    counter         INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, epoch)
);

CREATE TABLE IF NOT EXISTS historical_keys (
    user_id    TEXT NOT NULL,
    epoch      INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, epoch)
);
CREATE INDEX IF NOT EXISTS idx_historical_keys_user ON historical_keys(user_id);
"#;

/// A cached identity key pair.
#[derive(Debug, Clone)]
pub struct IdentityKeyRow {
    /// Owning user.
    pub user_id: String,
    /// X25519 public key.
    pub public_key: [u8; 32],
    /// X25519 secret key.
    pub secret_key: [u8; 32],
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

/// A cached session key record.
#[derive(Debug, Clone)]
pub struct SessionKeyRow {
    /// Conversation this session belongs to.
    pub conversation_id: String,
    /// Identity epoch this session was derived under.
    pub epoch: u32,
    /// HKDF-derived session key.
    pub session_key: [u8; 32],
    /// Messages sent on this record so far.
    pub counter: u64,
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

/// A cached historical public key.
#[derive(Debug, Clone)]
pub struct HistoricalKeyRow {
    /// Owning user.
    pub user_id: String,
    /// Epoch this key was current for.
    pub epoch: u32,
    /// The public key itself.
    pub public_key: [u8; 32],
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

/// On-device SQLite-backed key cache.
pub struct LocalKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalKeyStore {
    /// Open (or create) the local key store. `None` opens an in-memory
    /// database, used in tests and by callers without a persistent-storage
    /// requirement.
    pub async fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(CREATE_TABLES)?;
        tracing::debug!("local key store opened ({})", path.unwrap_or(":memory:"));
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ========================================================================
    // identity_keys
    // ========================================================================

    /// Insert or replace this user's local identity key pair.
    pub fn put_identity_keys(&self, row: &IdentityKeyRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identity_keys (user_id, public_key, secret_key, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                public_key = excluded.public_key,
                secret_key = excluded.secret_key,
                created_at = excluded.created_at",
            params![row.user_id, row.public_key.to_vec(), row.secret_key.to_vec(), row.created_at],
        )?;
        Ok(())
    }

    /// Read this user's local identity key pair, if present. A missing row
    /// returns `Ok(None)`, never an error.
    pub fn get_identity_keys(&self, user_id: &str) -> Result<Option<IdentityKeyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT public_key, secret_key, created_at FROM identity_keys WHERE user_id = ?1",
            params![user_id],
            |row| {
                let public_key: Vec<u8> = row.get(0)?;
                let secret_key: Vec<u8> = row.get(1)?;
                Ok(IdentityKeyRow {
                    user_id: user_id.to_string(),
                    public_key: to_array(&public_key),
                    secret_key: to_array(&secret_key),
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Delete this user's local identity key pair, if any.
    pub fn delete_identity_keys(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM identity_keys WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    // ========================================================================
    // session_keys
    // ========================================================================

    /// Insert or replace a session key record.
    pub fn put_session_key(&self, row: &SessionKeyRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_keys (conversation_id, epoch, session_key, counter, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id, epoch) DO UPDATE SET
                session_key = excluded.session_key,
                counter = excluded.counter,
                created_at = excluded.created_at",
            params![row.conversation_id, row.epoch, row.session_key.to_vec(), row.counter as i64, row.created_at],
        )?;
        Ok(())
    }

    /// Look up a session key record by `(conversation, epoch)`.
    pub fn get_session_key(&self, conversation_id: &str, epoch: u32) -> Result<Option<SessionKeyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT session_key, counter, created_at FROM session_keys
             WHERE conversation_id = ?1 AND epoch = ?2",
            params![conversation_id, epoch],
            |row| {
                let session_key: Vec<u8> = row.get(0)?;
                let counter: i64 = row.get(1)?;
                Ok(SessionKeyRow {
                    conversation_id: conversation_id.to_string(),
                    epoch,
                    session_key: to_array(&session_key),
                    counter: counter as u64,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// List every session key record for a conversation, across epochs.
    pub fn list_session_keys_by_conversation(&self, conversation_id: &str) -> Result<Vec<SessionKeyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch, session_key, counter, created_at FROM session_keys WHERE conversation_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                let epoch: u32 = row.get(0)?;
                let session_key: Vec<u8> = row.get(1)?;
                let counter: i64 = row.get(2)?;
                Ok(SessionKeyRow {
                    conversation_id: conversation_id.to_string(),
                    epoch,
                    session_key: to_array(&session_key),
                    counter: counter as u64,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a session key record, e.g. during stale-session auto-repair.
    pub fn delete_session_key(&self, conversation_id: &str, epoch: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_keys WHERE conversation_id = ?1 AND epoch = ?2",
            params![conversation_id, epoch],
        )?;
        Ok(())
    }

    /// Atomically increment a session's message counter and return the new
    /// value. The read-modify-write happens under the connection's single
    /// lock, making it atomic with respect to other calls on this store.
    pub fn increment_counter(&self, conversation_id: &str, epoch: u32) -> Result<u64> {
        let conn = self.conn.lock();
        let current: i64 = conn.query_row(
            "SELECT counter FROM session_keys WHERE conversation_id = ?1 AND epoch = ?2",
            params![conversation_id, epoch],
            |row| row.get(0),
        )?;
        let next = current + 1;
        conn.execute(
            "UPDATE session_keys SET counter = ?1 WHERE conversation_id = ?2 AND epoch = ?3",
            params![next, conversation_id, epoch],
        )?;
        Ok(next as u64)
    }

    // ========================================================================
    // historical_keys (local cache half of HistoricalKeys)
    // ========================================================================

    /// Cache a historical public key locally.
    pub fn put_historical_key(&self, row: &HistoricalKeyRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO historical_keys (user_id, epoch, public_key, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, epoch) DO UPDATE SET public_key = excluded.public_key",
            params![row.user_id, row.epoch, row.public_key.to_vec(), row.created_at],
        )?;
        Ok(())
    }

    /// Read a cached historical public key, if present.
    pub fn get_historical_key(&self, user_id: &str, epoch: u32) -> Result<Option<HistoricalKeyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT public_key, created_at FROM historical_keys WHERE user_id = ?1 AND epoch = ?2",
            params![user_id, epoch],
            |row| {
                let public_key: Vec<u8> = row.get(0)?;
                Ok(HistoricalKeyRow {
                    user_id: user_id.to_string(),
                    epoch,
                    public_key: to_array(&public_key),
                    created_at: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// List every cached historical key for a user.
    pub fn list_historical_keys_by_user(&self, user_id: &str) -> Result<Vec<HistoricalKeyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch, public_key, created_at FROM historical_keys WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let epoch: u32 = row.get(0)?;
                let public_key: Vec<u8> = row.get(1)?;
                Ok(HistoricalKeyRow {
                    user_id: user_id.to_string(),
                    epoch,
                    public_key: to_array(&public_key),
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Wipe every table. Used by `clear_local_data`.
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM identity_keys; DELETE FROM session_keys; DELETE FROM historical_keys;",
        )?;
        Ok(())
    }

    /// Wipe only `session_keys`. Used whenever the identity key changes
    /// underneath a user (fresh generation, restore, mismatch repair) —
    /// sessions derived under the old identity are no longer valid.
    pub fn clear_session_keys(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_keys", [])?;
        Ok(())
    }
}

fn to_array(bytes: &[u8]) -> [u8; 32] {
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes[..32.min(bytes.len())]);
    arr
}
