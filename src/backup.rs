//! # BackupManager
//!
//! Creates, updates, and restores identity backups (password and recovery
//! paths) and session-key backups under a stable session-backup key. This
//! is the only layer that ever touches `identity_key_backups` and
//! `conversation_session_keys` — [`crate::manager::KeyManager`] calls
//! through here rather than the remote store directly.

use crate::config::Pbkdf2Config;
use crate::crypto::password::{self, PasswordSealed};
use crate::crypto::primitives;
use crate::error::{Error, Result};
use crate::store::remote::{IdentityBackupRow, RemoteKeyStore, SessionKeyBackupRow};
use std::sync::Arc;

/// Result of creating an identity backup: the recovery key in its
/// display form, and the session-backup key the caller should install
/// for subsequent session backups.
pub struct IdentityBackupCreated {
    /// Recovery key formatted for display (see [`crate::crypto::password::format_recovery_key`]).
    pub recovery_key_formatted: String,
    /// Freshly generated stable session-backup key.
    pub session_backup_key: [u8; 32],
}

/// An individual session-key row successfully restored from backup.
pub struct RestoredSessionKey {
    /// Conversation the session belongs to.
    pub conversation_id: String,
    /// Identity epoch the session was derived under.
    pub epoch: u32,
    /// The recovered session key.
    pub session_key: [u8; 32],
    /// Message counter recorded at backup time.
    pub counter: u64,
}

/// An individual session-key row that failed to restore, with why.
pub struct FailedSessionKey {
    /// Conversation the session belongs to.
    pub conversation_id: String,
    /// Identity epoch the session was derived under.
    pub epoch: u32,
    /// The error encountered restoring this one row.
    pub error: Error,
}

/// Manages identity and session-key backups against a [`RemoteKeyStore`].
pub struct BackupManager {
    remote: Arc<dyn RemoteKeyStore>,
    pbkdf2: Pbkdf2Config,
}

impl BackupManager {
    /// Build a backup manager over the given remote store and PBKDF2 policy.
    pub fn new(remote: Arc<dyn RemoteKeyStore>, pbkdf2: Pbkdf2Config) -> Self {
        Self { remote, pbkdf2 }
    }

    /// Create an identity backup with a freshly generated recovery key.
    /// Generates a new session-backup key and returns both it and the
    /// recovery key's display form — the caller installs the former for
    /// subsequent session backups and shows the latter to the user once.
    pub async fn create_identity_backup(&self, user_id: &str, sk: &[u8; 32], password: &str) -> Result<IdentityBackupCreated> {
        let recovery_key = password::generate_recovery_key();
        self.create_identity_backup_with_recovery_key(user_id, sk, password, &recovery_key)
            .await
    }

    /// Create an identity backup with a caller-supplied recovery key, e.g.
    /// the device-pairing path where the recovery key already exists.
    pub async fn create_identity_backup_with_recovery_key(
        &self,
        user_id: &str,
        sk: &[u8; 32],
        password: &str,
        recovery_key: &[u8; 32],
    ) -> Result<IdentityBackupCreated> {
        if !password::is_password_acceptable(password) {
            let score = password::score_password(password);
            return Err(Error::WeakPassword { score });
        }

        let password_sealed = self.seal_with_password(sk, password)?;
        let recovery_sealed = self.seal_with_password(sk, &recovery_key_as_password(recovery_key))?;

        let session_backup_key = primitives::random_bytes(32);
        let session_backup_key: [u8; 32] = session_backup_key
            .try_into()
            .expect("random_bytes(32) returns 32 bytes");
        let sbk_sealed = self.seal_with_password(&session_backup_key, password)?;

        self.upsert_backup_row(user_id, password_sealed, Some(recovery_sealed), Some(sbk_sealed))
            .await?;

        Ok(IdentityBackupCreated {
            recovery_key_formatted: password::format_recovery_key(recovery_key),
            session_backup_key,
        })
    }

    /// Create a backup with only the password path populated; recovery
    /// fields are stored as null. A session-backup key is still generated
    /// and encrypted under the password-derived key.
    pub async fn create_password_only_backup(&self, user_id: &str, sk: &[u8; 32], password: &str) -> Result<[u8; 32]> {
        if !password::is_password_acceptable(password) {
            let score = password::score_password(password);
            return Err(Error::WeakPassword { score });
        }

        let password_sealed = self.seal_with_password(sk, password)?;
        let session_backup_key = primitives::random_bytes(32);
        let session_backup_key: [u8; 32] = session_backup_key
            .try_into()
            .expect("random_bytes(32) returns 32 bytes");
        let sbk_sealed = self.seal_with_password(&session_backup_key, password)?;

        self.upsert_backup_row(user_id, password_sealed, None, Some(sbk_sealed))
            .await?;

        Ok(session_backup_key)
    }

    /// Restore the identity secret from the password-derived ciphertext.
    pub async fn restore_from_password(&self, user_id: &str, password: &str) -> Result<[u8; 32]> {
        let row = self.require_backup_row(user_id).await?;
        let sealed = PasswordSealed {
            ciphertext: row.password_ct,
            salt: row.password_salt,
            iv: row.password_iv,
        };
        self.open_with_password(&sealed, password)
    }

    /// Restore the identity secret from the recovery-key-derived
    /// ciphertext.
    pub async fn restore_from_recovery_key(&self, user_id: &str, recovery_key: &[u8; 32]) -> Result<[u8; 32]> {
        let row = self.require_backup_row(user_id).await?;
        let (ct, salt, iv) = match (row.recovery_ct, row.recovery_salt, row.recovery_iv) {
            (Some(ct), Some(salt), Some(iv)) => (ct, salt, iv),
            _ => return Err(Error::AuthFail),
        };
        let sealed = PasswordSealed { ciphertext: ct, salt, iv };
        self.open_with_password(&sealed, &recovery_key_as_password(recovery_key))
    }

    /// Restore the stable session-backup key from the password-sealed
    /// ciphertext. Returns `None` if the backup predates this feature
    /// (the recovery-key path cannot restore this key at all, by design —
    /// sessions lazily re-derive via ECDH instead).
    pub async fn restore_session_backup_key(&self, user_id: &str, password: &str) -> Result<Option<[u8; 32]>> {
        let row = self.require_backup_row(user_id).await?;
        let (ct, salt, iv) = match (
            row.session_backup_key_ct,
            row.session_backup_key_salt,
            row.session_backup_key_iv,
        ) {
            (Some(ct), Some(salt), Some(iv)) => (ct, salt, iv),
            _ => return Ok(None),
        };
        let sealed = PasswordSealed { ciphertext: ct, salt, iv };
        let bytes = self.open_with_password(&sealed, password)?;
        Ok(Some(
            bytes.try_into().map_err(|_| Error::Internal("session-backup key is not 32 bytes".into()))?,
        ))
    }

    /// Seal a session key under the stable session-backup key and upsert
    /// it into `conversation_session_keys`.
    pub async fn backup_session_key(
        &self,
        user_id: &str,
        conversation_id: &str,
        session_key: &[u8; 32],
        epoch: u32,
        backup_key: &[u8; 32],
        counter: u64,
    ) -> Result<()> {
        let nonce = primitives::random_nonce();
        let ciphertext = primitives::aead_seal(backup_key, &nonce, session_key);

        self.remote
            .upsert_session_backup(SessionKeyBackupRow {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                key_epoch: epoch,
                encrypted_session_key: ciphertext,
                encryption_nonce: nonce,
                message_counter: counter,
                updated_at: crate::time::now_timestamp(),
            })
            .await
    }

    /// Decrypt every session-key backup row for a user under `backup_key`.
    /// Individual rows that fail to decrypt are collected in `failed`
    /// rather than silently dropped or aborting the whole restore.
    pub async fn restore_session_keys(
        &self,
        user_id: &str,
        backup_key: &[u8; 32],
    ) -> Result<(Vec<RestoredSessionKey>, Vec<FailedSessionKey>)> {
        let rows = self.remote.list_session_backups(user_id).await?;
        let mut restored = Vec::new();
        let mut failed = Vec::new();

        for row in rows {
            match primitives::aead_open(backup_key, &row.encryption_nonce, &row.encrypted_session_key) {
                Ok(bytes) => match <[u8; 32]>::try_from(bytes) {
                    Ok(session_key) => restored.push(RestoredSessionKey {
                        conversation_id: row.conversation_id,
                        epoch: row.key_epoch,
                        session_key,
                        counter: row.message_counter,
                    }),
                    Err(_) => failed.push(FailedSessionKey {
                        conversation_id: row.conversation_id,
                        epoch: row.key_epoch,
                        error: Error::Internal("decrypted session key is not 32 bytes".into()),
                    }),
                },
                Err(err) => failed.push(FailedSessionKey {
                    conversation_id: row.conversation_id,
                    epoch: row.key_epoch,
                    error: err,
                }),
            }
        }

        Ok((restored, failed))
    }

    /// Restore every session-key backup under `old_backup_key` and
    /// re-seal it under `new_backup_key`. Rows that fail to restore under
    /// the old key are skipped, never propagated — they're unrecoverable
    /// either way.
    pub async fn re_encrypt_session_backups(
        &self,
        user_id: &str,
        old_backup_key: &[u8; 32],
        new_backup_key: &[u8; 32],
    ) -> Result<()> {
        let (restored, failed) = self.restore_session_keys(user_id, old_backup_key).await?;
        for failure in &failed {
            tracing::warn!(
                user = user_id,
                conversation = failure.conversation_id,
                epoch = failure.epoch,
                error = %failure.error,
                "skipping session backup row that failed to decrypt during re-encryption"
            );
        }

        for row in restored {
            self.backup_session_key(
                user_id,
                &row.conversation_id,
                &row.session_key,
                row.epoch,
                new_backup_key,
                row.counter,
            )
            .await?;
        }

        Ok(())
    }

    /// Restore the identity secret under `old_password`, then re-create
    /// the entire identity backup under `new_password`.
    ///
    /// This rotates **both** the recovery key and the session-backup key
    /// — any previously issued recovery key or session-backup key becomes
    /// unusable. Callers that present this as a simple "change password"
    /// action must warn the user that their recovery key changes too.
    pub async fn update_password(&self, user_id: &str, sk: &[u8; 32], old_password: &str, new_password: &str) -> Result<IdentityBackupCreated> {
        let restored = self.restore_from_password(user_id, old_password).await?;
        if !primitives::ct_eq(&restored, sk) {
            return Err(Error::Internal("restored secret does not match caller-supplied identity key".into()));
        }
        self.create_identity_backup(user_id, sk, new_password).await
    }

    async fn require_backup_row(&self, user_id: &str) -> Result<IdentityBackupRow> {
        self.remote
            .get_identity_backup(user_id)
            .await?
            .ok_or(Error::AuthFail)
    }

    async fn upsert_backup_row(
        &self,
        user_id: &str,
        password_sealed: PasswordSealed,
        recovery_sealed: Option<PasswordSealed>,
        sbk_sealed: Option<PasswordSealed>,
    ) -> Result<()> {
        self.remote
            .upsert_identity_backup(IdentityBackupRow {
                user_id: user_id.to_string(),
                password_ct: password_sealed.ciphertext,
                password_salt: password_sealed.salt,
                password_iv: password_sealed.iv,
                recovery_ct: recovery_sealed.as_ref().map(|s| s.ciphertext.clone()),
                recovery_salt: recovery_sealed.as_ref().map(|s| s.salt),
                recovery_iv: recovery_sealed.as_ref().map(|s| s.iv),
                session_backup_key_ct: sbk_sealed.as_ref().map(|s| s.ciphertext.clone()),
                session_backup_key_salt: sbk_sealed.as_ref().map(|s| s.salt),
                session_backup_key_iv: sbk_sealed.as_ref().map(|s| s.iv),
                updated_at: crate::time::now_timestamp(),
            })
            .await
    }

    fn seal_with_password(&self, data: &[u8], password: &[u8]) -> Result<PasswordSealed> {
        password::encrypt_with_password(data, password, self.pbkdf2.effective_iterations(), self.pbkdf2.key_length_bits)
    }

    fn open_with_password(&self, sealed: &PasswordSealed, password: &[u8]) -> Result<Vec<u8>> {
        password::decrypt_with_password(sealed, password, self.pbkdf2.effective_iterations(), self.pbkdf2.key_length_bits)
    }
}

/// The raw recovery-key bytes are themselves the PBKDF2 password input —
/// see [`crate::crypto::password::format_recovery_key`] for why this has
/// to be the raw bytes rather than their display-formatted string.
fn recovery_key_as_password(recovery_key: &[u8; 32]) -> Vec<u8> {
    recovery_key.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::remote::SqliteRemoteKeyStore;

    fn test_pbkdf2() -> Pbkdf2Config {
        Pbkdf2Config {
            iterations: 10_000,
            key_length_bits: 256,
        }
    }

    async fn manager() -> BackupManager {
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        BackupManager::new(remote, test_pbkdf2())
    }

    #[tokio::test]
    async fn test_identity_backup_round_trip_both_paths() {
        let mgr = manager().await;
        let sk = [5u8; 32];

        let created = mgr.create_identity_backup("alice", &sk, "Hunter2!Abc").await.unwrap();

        let from_password = mgr.restore_from_password("alice", "Hunter2!Abc").await.unwrap();
        assert_eq!(from_password, sk);

        let rk = password::parse_recovery_key(&created.recovery_key_formatted).unwrap();
        let from_recovery = mgr.restore_from_recovery_key("alice", &rk).await.unwrap();
        assert_eq!(from_recovery, sk);
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_fail() {
        let mgr = manager().await;
        let sk = [5u8; 32];
        mgr.create_identity_backup("alice", &sk, "Hunter2!Abc").await.unwrap();

        let result = mgr.restore_from_password("alice", "WrongPassword!1").await;
        assert!(matches!(result, Err(Error::AuthFail)));
    }

    #[tokio::test]
    async fn test_password_only_backup_has_no_recovery_path() {
        let mgr = manager().await;
        let sk = [5u8; 32];
        mgr.create_password_only_backup("alice", &sk, "Hunter2!Abc").await.unwrap();

        let row = mgr.remote.get_identity_backup("alice").await.unwrap().unwrap();
        assert!(row.recovery_ct.is_none());

        let result = mgr.restore_from_recovery_key("alice", &[0u8; 32]).await;
        assert!(matches!(result, Err(Error::AuthFail)));
    }

    #[tokio::test]
    async fn test_session_backup_key_restore() {
        let mgr = manager().await;
        let sk = [5u8; 32];
        let created = mgr.create_identity_backup("alice", &sk, "Hunter2!Abc").await.unwrap();

        let restored_sbk = mgr.restore_session_backup_key("alice", "Hunter2!Abc").await.unwrap();
        assert_eq!(restored_sbk, Some(created.session_backup_key));
    }

    #[tokio::test]
    async fn test_session_key_backup_and_restore_collects_failures() {
        let mgr = manager().await;
        let backup_key = [9u8; 32];
        mgr.backup_session_key("alice", "c1", &[1u8; 32], 0, &backup_key, 3).await.unwrap();
        mgr.backup_session_key("alice", "c2", &[2u8; 32], 0, &backup_key, 7).await.unwrap();

        let (restored, failed) = mgr.restore_session_keys("alice", &backup_key).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert!(failed.is_empty());

        let wrong_key = [1u8; 32];
        let (restored, failed) = mgr.restore_session_keys("alice", &wrong_key).await.unwrap();
        assert!(restored.is_empty());
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_re_encrypt_session_backups() {
        let mgr = manager().await;
        let old_key = [9u8; 32];
        let new_key = [8u8; 32];
        mgr.backup_session_key("alice", "c1", &[1u8; 32], 0, &old_key, 3).await.unwrap();

        mgr.re_encrypt_session_backups("alice", &old_key, &new_key).await.unwrap();

        let (restored, _) = mgr.restore_session_keys("alice", &new_key).await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].session_key, [1u8; 32]);
    }

    #[tokio::test]
    async fn test_update_password_rotates_recovery_key() {
        let mgr = manager().await;
        let sk = [5u8; 32];
        let first = mgr.create_identity_backup("alice", &sk, "Hunter2!Abc").await.unwrap();

        let second = mgr.update_password("alice", &sk, "Hunter2!Abc", "NewPass2!Xyz").await.unwrap();

        assert_ne!(first.recovery_key_formatted, second.recovery_key_formatted);
        assert_ne!(first.session_backup_key, second.session_backup_key);

        assert!(matches!(
            mgr.restore_from_password("alice", "Hunter2!Abc").await,
            Err(Error::AuthFail)
        ));
        assert_eq!(mgr.restore_from_password("alice", "NewPass2!Xyz").await.unwrap(), sk);
    }
}
