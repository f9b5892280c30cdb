//! # RemoteKeyStore
//!
//! The authoritative collections a production deployment keeps in its
//! backing database: the current public key per user, the append-only
//! history of past public keys, identity/session-key backups, and
//! short-lived rotation locks. Defined as an `async_trait` port — one
//! typed method per logical operation — rather than the distilled
//! `select/insert/update/upsert/delete`-with-filter-maps shape, which
//! fits a dynamically-typed host but not a statically-typed one; this
//! crate exposes no generic query surface, the same way the rest of the
//! storage layer exposes typed methods per entity.
//!
//! [`SqliteRemoteKeyStore`] is a reference implementation backed by its
//! own SQLite connection, so the engine is self-contained and testable
//! without a live network service. A production host swaps in its own
//! implementation of the trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// `identity_keys(user_id PK, public_key, current_epoch, updated_at)`.
#[derive(Debug, Clone)]
pub struct RemoteIdentityKeyRow {
    /// Owning user.
    pub user_id: String,
    /// Current public key.
    pub public_key: [u8; 32],
    /// Current epoch.
    pub current_epoch: u32,
    /// Unix timestamp, seconds.
    pub updated_at: i64,
}

/// `public_key_history(user_id, epoch, public_key, created_at)`.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    /// Owning user.
    pub user_id: String,
    /// Epoch the key was current for.
    pub epoch: u32,
    /// The public key itself.
    pub public_key: [u8; 32],
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

/// `identity_key_backups(user_id PK, password_{ct,salt,iv},
/// recovery_{ct,salt,iv}?, session_backup_key_{ct,salt,iv}?, updated_at)`.
#[derive(Debug, Clone)]
pub struct IdentityBackupRow {
    /// Owning user.
    pub user_id: String,
    /// Identity secret sealed under the password-derived key.
    pub password_ct: Vec<u8>,
    /// PBKDF2 salt for the password ciphertext.
    pub password_salt: [u8; 32],
    /// AES-GCM IV for the password ciphertext.
    pub password_iv: [u8; 12],
    /// Identity secret sealed under the recovery-key-derived key, if any.
    pub recovery_ct: Option<Vec<u8>>,
    /// PBKDF2 salt for the recovery ciphertext.
    pub recovery_salt: Option<[u8; 32]>,
    /// AES-GCM IV for the recovery ciphertext.
    pub recovery_iv: Option<[u8; 12]>,
    /// Session-backup key sealed under the password-derived key, if any.
    pub session_backup_key_ct: Option<Vec<u8>>,
    /// PBKDF2 salt for the session-backup-key ciphertext.
    pub session_backup_key_salt: Option<[u8; 32]>,
    /// AES-GCM IV for the session-backup-key ciphertext.
    pub session_backup_key_iv: Option<[u8; 12]>,
    /// Unix timestamp, seconds.
    pub updated_at: i64,
}

/// `conversation_session_keys(user_id, conversation_id, key_epoch,
/// encrypted_session_key, encryption_nonce, message_counter, updated_at)`.
#[derive(Debug, Clone)]
pub struct SessionKeyBackupRow {
    /// Owning user.
    pub user_id: String,
    /// Conversation the session belongs to.
    pub conversation_id: String,
    /// Identity epoch the session was derived under.
    pub key_epoch: u32,
    /// Session key sealed under the stable session-backup key.
    pub encrypted_session_key: Vec<u8>,
    /// XSalsa20-Poly1305 nonce.
    pub encryption_nonce: [u8; 24],
    /// Last known message counter for this session.
    pub message_counter: u64,
    /// Unix timestamp, seconds.
    pub updated_at: i64,
}

/// `key_rotation_locks(user_id PK, lock_token, locked_at, expires_at)`.
#[derive(Debug, Clone)]
pub struct RotationLockRow {
    /// Owning user.
    pub user_id: String,
    /// Random token identifying the lease holder.
    pub lock_token: Uuid,
    /// When the lease was acquired.
    pub locked_at: i64,
    /// When the lease expires.
    pub expires_at: i64,
}

/// Authoritative remote key store. No cryptographic logic lives behind
/// this trait — it moves bytes and enforces uniqueness.
#[async_trait]
pub trait RemoteKeyStore: Send + Sync {
    /// Upsert the current public key and epoch for `user_id`.
    async fn upsert_identity_key(&self, user_id: &str, public_key: &[u8; 32], current_epoch: u32) -> Result<()>;

    /// Read the current public key record for `user_id`.
    async fn get_identity_key(&self, user_id: &str) -> Result<Option<RemoteIdentityKeyRow>>;

    /// Append `(user_id, epoch, public_key)` to history. Unique on
    /// `(user_id, epoch)`; a duplicate insert is treated as success.
    async fn insert_history(&self, user_id: &str, epoch: u32, public_key: &[u8; 32]) -> Result<()>;

    /// Read a specific historical public key.
    async fn get_history(&self, user_id: &str, epoch: u32) -> Result<Option<[u8; 32]>>;

    /// List every historical public key for a user.
    async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRow>>;

    /// Upsert a user's identity backup row.
    async fn upsert_identity_backup(&self, row: IdentityBackupRow) -> Result<()>;

    /// Read a user's identity backup row, if any.
    async fn get_identity_backup(&self, user_id: &str) -> Result<Option<IdentityBackupRow>>;

    /// Upsert a session-key backup row, unique on
    /// `(user_id, conversation_id, key_epoch)`.
    async fn upsert_session_backup(&self, row: SessionKeyBackupRow) -> Result<()>;

    /// Read a single session-key backup row.
    async fn get_session_backup(
        &self,
        user_id: &str,
        conversation_id: &str,
        epoch: u32,
    ) -> Result<Option<SessionKeyBackupRow>>;

    /// List every session-key backup row for a user, across conversations.
    async fn list_session_backups(&self, user_id: &str) -> Result<Vec<SessionKeyBackupRow>>;

    /// Best-effort update of a session backup's message counter, used by
    /// the encrypt path after a local counter increment.
    async fn update_session_backup_counter(
        &self,
        user_id: &str,
        conversation_id: &str,
        epoch: u32,
        counter: u64,
    ) -> Result<()>;

    /// Attempt to acquire the rotation lease for `user_id`. Succeeds if no
    /// lease exists or the existing lease has expired; fails (`Ok(false)`)
    /// if a live lease is already held by someone else.
    async fn acquire_rotation_lock(&self, user_id: &str, token: Uuid, ttl_seconds: i64, now: i64) -> Result<bool>;

    /// Release the rotation lease for `user_id`, only if `token` matches
    /// the current holder (a stale release from a prior lease is a no-op).
    async fn release_rotation_lock(&self, user_id: &str, token: Uuid) -> Result<()>;
}

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT PRIMARY KEY,
    public_key BLOB NOT NULL,
    current_epoch INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS public_key_history (
    user_id TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, epoch)
);

CREATE TABLE IF NOT EXISTS identity_key_backups (
    user_id TEXT PRIMARY KEY,
    password_ct BLOB NOT NULL,
    password_salt BLOB NOT NULL,
    password_iv BLOB NOT NULL,
    recovery_ct BLOB,
    recovery_salt BLOB,
    recovery_iv BLOB,
    session_backup_key_ct BLOB,
    session_backup_key_salt BLOB,
    session_backup_key_iv BLOB,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_session_keys (
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    key_epoch INTEGER NOT NULL,
    encrypted_session_key BLOB NOT NULL,
    encryption_nonce BLOB NOT NULL,
    message_counter INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, conversation_id, key_epoch)
);

CREATE TABLE IF NOT EXISTS key_rotation_locks (
    user_id TEXT PRIMARY KEY,
    lock_token TEXT NOT NULL,
    locked_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// Reference `RemoteKeyStore` backed by its own SQLite connection.
pub struct SqliteRemoteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRemoteKeyStore {
    /// Open (or create) the reference remote store.
    pub async fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl RemoteKeyStore for SqliteRemoteKeyStore {
    async fn upsert_identity_key(&self, user_id: &str, public_key: &[u8; 32], current_epoch: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identity_keys (user_id, public_key, current_epoch, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                public_key = excluded.public_key,
                current_epoch = excluded.current_epoch,
                updated_at = excluded.updated_at",
            params![user_id, public_key.to_vec(), current_epoch, crate::time::now_timestamp()],
        )?;
        Ok(())
    }

    async fn get_identity_key(&self, user_id: &str) -> Result<Option<RemoteIdentityKeyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT public_key, current_epoch, updated_at FROM identity_keys WHERE user_id = ?1",
            params![user_id],
            |row| {
                let public_key: Vec<u8> = row.get(0)?;
                Ok(RemoteIdentityKeyRow {
                    user_id: user_id.to_string(),
                    public_key: to_array32(&public_key),
                    current_epoch: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn insert_history(&self, user_id: &str, epoch: u32, public_key: &[u8; 32]) -> Result<()> {
        let conn = self.conn.lock();
        // INSERT OR IGNORE: a duplicate (user_id, epoch) is treated as
        // success per the ConstraintViolation policy — never surfaced.
        conn.execute(
            "INSERT OR IGNORE INTO public_key_history (user_id, epoch, public_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, epoch, public_key.to_vec(), crate::time::now_timestamp()],
        )?;
        Ok(())
    }

    async fn get_history(&self, user_id: &str, epoch: u32) -> Result<Option<[u8; 32]>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT public_key FROM public_key_history WHERE user_id = ?1 AND epoch = ?2",
            params![user_id, epoch],
            |row| {
                let public_key: Vec<u8> = row.get(0)?;
                Ok(to_array32(&public_key))
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch, public_key, created_at FROM public_key_history WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let public_key: Vec<u8> = row.get(1)?;
                Ok(HistoryRow {
                    user_id: user_id.to_string(),
                    epoch: row.get(0)?,
                    public_key: to_array32(&public_key),
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn upsert_identity_backup(&self, row: IdentityBackupRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identity_key_backups (
                user_id, password_ct, password_salt, password_iv,
                recovery_ct, recovery_salt, recovery_iv,
                session_backup_key_ct, session_backup_key_salt, session_backup_key_iv,
                updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(user_id) DO UPDATE SET
                password_ct = excluded.password_ct,
                password_salt = excluded.password_salt,
                password_iv = excluded.password_iv,
                recovery_ct = excluded.recovery_ct,
                recovery_salt = excluded.recovery_salt,
                recovery_iv = excluded.recovery_iv,
                session_backup_key_ct = excluded.session_backup_key_ct,
                session_backup_key_salt = excluded.session_backup_key_salt,
                session_backup_key_iv = excluded.session_backup_key_iv,
                updated_at = excluded.updated_at",
            params![
                row.user_id,
                row.password_ct,
                row.password_salt.to_vec(),
                row.password_iv.to_vec(),
                row.recovery_ct,
                row.recovery_salt.map(|s| s.to_vec()),
                row.recovery_iv.map(|s| s.to_vec()),
                row.session_backup_key_ct,
                row.session_backup_key_salt.map(|s| s.to_vec()),
                row.session_backup_key_iv.map(|s| s.to_vec()),
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_identity_backup(&self, user_id: &str) -> Result<Option<IdentityBackupRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT password_ct, password_salt, password_iv,
                    recovery_ct, recovery_salt, recovery_iv,
                    session_backup_key_ct, session_backup_key_salt, session_backup_key_iv,
                    updated_at
             FROM identity_key_backups WHERE user_id = ?1",
            params![user_id],
            |row| {
                let password_salt: Vec<u8> = row.get(1)?;
                let password_iv: Vec<u8> = row.get(2)?;
                let recovery_ct: Option<Vec<u8>> = row.get(3)?;
                let recovery_salt: Option<Vec<u8>> = row.get(4)?;
                let recovery_iv: Option<Vec<u8>> = row.get(5)?;
                let sbk_ct: Option<Vec<u8>> = row.get(6)?;
                let sbk_salt: Option<Vec<u8>> = row.get(7)?;
                let sbk_iv: Option<Vec<u8>> = row.get(8)?;
                Ok(IdentityBackupRow {
                    user_id: user_id.to_string(),
                    password_ct: row.get(0)?,
                    password_salt: to_array32(&password_salt),
                    password_iv: to_array12(&password_iv),
                    recovery_ct,
                    recovery_salt: recovery_salt.map(|s| to_array32(&s)),
                    recovery_iv: recovery_iv.map(|s| to_array12(&s)),
                    session_backup_key_ct: sbk_ct,
                    session_backup_key_salt: sbk_salt.map(|s| to_array32(&s)),
                    session_backup_key_iv: sbk_iv.map(|s| to_array12(&s)),
                    updated_at: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn upsert_session_backup(&self, row: SessionKeyBackupRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_session_keys (
                user_id, conversation_id, key_epoch, encrypted_session_key,
                encryption_nonce, message_counter, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, conversation_id, key_epoch) DO UPDATE SET
                encrypted_session_key = excluded.encrypted_session_key,
                encryption_nonce = excluded.encryption_nonce,
                message_counter = excluded.message_counter,
                updated_at = excluded.updated_at",
            params![
                row.user_id,
                row.conversation_id,
                row.key_epoch,
                row.encrypted_session_key,
                row.encryption_nonce.to_vec(),
                row.message_counter as i64,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_session_backup(
        &self,
        user_id: &str,
        conversation_id: &str,
        epoch: u32,
    ) -> Result<Option<SessionKeyBackupRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT encrypted_session_key, encryption_nonce, message_counter, updated_at
             FROM conversation_session_keys
             WHERE user_id = ?1 AND conversation_id = ?2 AND key_epoch = ?3",
            params![user_id, conversation_id, epoch],
            |row| {
                let nonce: Vec<u8> = row.get(1)?;
                let counter: i64 = row.get(2)?;
                Ok(SessionKeyBackupRow {
                    user_id: user_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    key_epoch: epoch,
                    encrypted_session_key: row.get(0)?,
                    encryption_nonce: to_array24(&nonce),
                    message_counter: counter as u64,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn list_session_backups(&self, user_id: &str) -> Result<Vec<SessionKeyBackupRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, key_epoch, encrypted_session_key, encryption_nonce,
                    message_counter, updated_at
             FROM conversation_session_keys WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let nonce: Vec<u8> = row.get(3)?;
                let counter: i64 = row.get(4)?;
                Ok(SessionKeyBackupRow {
                    user_id: user_id.to_string(),
                    conversation_id: row.get(0)?,
                    key_epoch: row.get(1)?,
                    encrypted_session_key: row.get(2)?,
                    encryption_nonce: to_array24(&nonce),
                    message_counter: counter as u64,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn update_session_backup_counter(
        &self,
        user_id: &str,
        conversation_id: &str,
        epoch: u32,
        counter: u64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversation_session_keys SET message_counter = ?1, updated_at = ?2
             WHERE user_id = ?3 AND conversation_id = ?4 AND key_epoch = ?5",
            params![counter as i64, crate::time::now_timestamp(), user_id, conversation_id, epoch],
        )?;
        Ok(())
    }

    async fn acquire_rotation_lock(&self, user_id: &str, token: Uuid, ttl_seconds: i64, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM key_rotation_locks WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(expires_at) = existing {
            if expires_at > now {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT INTO key_rotation_locks (user_id, lock_token, locked_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                lock_token = excluded.lock_token,
                locked_at = excluded.locked_at,
                expires_at = excluded.expires_at",
            params![user_id, token.to_string(), now, now + ttl_seconds],
        )?;
        Ok(true)
    }

    async fn release_rotation_lock(&self, user_id: &str, token: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM key_rotation_locks WHERE user_id = ?1 AND lock_token = ?2",
            params![user_id, token.to_string()],
        )?;
        Ok(())
    }
}

fn to_array32(bytes: &[u8]) -> [u8; 32] {
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes[..32.min(bytes.len())]);
    arr
}

fn to_array12(bytes: &[u8]) -> [u8; 12] {
    let mut arr = [0u8; 12];
    arr.copy_from_slice(&bytes[..12.min(bytes.len())]);
    arr
}

fn to_array24(bytes: &[u8]) -> [u8; 24] {
    let mut arr = [0u8; 24];
    arr.copy_from_slice(&bytes[..24.min(bytes.len())]);
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteRemoteKeyStore {
        SqliteRemoteKeyStore::open(None).await.unwrap()
    }

    #[tokio::test]
    async fn test_identity_key_upsert_and_get() {
        let store = store().await;
        store.upsert_identity_key("alice", &[1u8; 32], 0).await.unwrap();
        let row = store.get_identity_key("alice").await.unwrap().unwrap();
        assert_eq!(row.public_key, [1u8; 32]);
        assert_eq!(row.current_epoch, 0);

        store.upsert_identity_key("alice", &[2u8; 32], 1).await.unwrap();
        let row = store.get_identity_key("alice").await.unwrap().unwrap();
        assert_eq!(row.public_key, [2u8; 32]);
        assert_eq!(row.current_epoch, 1);
    }

    #[tokio::test]
    async fn test_history_idempotent_insert() {
        let store = store().await;
        store.insert_history("alice", 0, &[1u8; 32]).await.unwrap();
        store.insert_history("alice", 0, &[1u8; 32]).await.unwrap();

        let rows = store.list_history("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_lock_exclusive() {
        let store = store().await;
        let token_a = Uuid::new_v4();
        let token_b = Uuid::new_v4();

        assert!(store.acquire_rotation_lock("alice", token_a, 60, 1000).await.unwrap());
        assert!(!store.acquire_rotation_lock("alice", token_b, 60, 1010).await.unwrap());

        store.release_rotation_lock("alice", token_a).await.unwrap();
        assert!(store.acquire_rotation_lock("alice", token_b, 60, 1020).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_lock_expires() {
        let store = store().await;
        let token_a = Uuid::new_v4();
        let token_b = Uuid::new_v4();

        assert!(store.acquire_rotation_lock("alice", token_a, 60, 1000).await.unwrap());
        // token_b tries after token_a's lease has expired.
        assert!(store.acquire_rotation_lock("alice", token_b, 60, 2000).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_backup_round_trip() {
        let store = store().await;
        store
            .upsert_session_backup(SessionKeyBackupRow {
                user_id: "alice".into(),
                conversation_id: "c1".into(),
                key_epoch: 0,
                encrypted_session_key: vec![9u8; 48],
                encryption_nonce: [4u8; 24],
                message_counter: 0,
                updated_at: 1000,
            })
            .await
            .unwrap();

        let row = store.get_session_backup("alice", "c1", 0).await.unwrap().unwrap();
        assert_eq!(row.message_counter, 0);

        store.update_session_backup_counter("alice", "c1", 0, 5).await.unwrap();
        let row = store.get_session_backup("alice", "c1", 0).await.unwrap().unwrap();
        assert_eq!(row.message_counter, 5);
    }
}
