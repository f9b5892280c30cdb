//! # KeyManager
//!
//! The orchestrator: lifecycle (initialize/generate/restore), key
//! rotation under a distributed lease, session establishment, message
//! encrypt/decrypt with one-shot auto-repair, and multi-device partner
//! key sync. Everything below this layer — [`crate::crypto`],
//! [`crate::store`], [`crate::historical`], [`crate::backup`] — is pure
//! or storage-only; this is the only module that sequences them against
//! a logical "current user".

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

use crate::backup::{BackupManager, IdentityBackupCreated};
use crate::collaborators::ConversationDirectory;
use crate::config::{EngineConfig, KeyRotationConfig, SafetyNumberConfig};
use crate::crypto::{kdf, primitives};
use crate::error::{Error, Result};
use crate::historical::HistoricalKeys;
use crate::store::local::{IdentityKeyRow, LocalKeyStore, SessionKeyRow};
use crate::store::remote::RemoteKeyStore;

/// Ceiling on a session's message counter: `2^53 - 1000`, leaving
/// headroom below the largest integer a double-precision host can
/// represent exactly, since this wire format is shared with hosts that
/// do not have a native 64-bit integer.
pub const MAX_COUNTER: u64 = (1u64 << 53) - 1000;

/// Rotation lease TTL, in seconds.
const ROTATION_LEASE_SECONDS: i64 = 60;

/// The production configuration fixes every session to this identity
/// epoch; the data layer (session_keys keyed by `(conversation, epoch)`)
/// still supports per-epoch sessions for a future rollout of rotation.
const SESSION_EPOCH: u32 = 0;

/// Outcome of [`KeyManager::initialize_for_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// Local identity keys are present and consistent with the remote
    /// record (or were just auto-repaired); the manager is ready to use.
    Ready,
    /// No local identity keys, and a backup exists remotely — the caller
    /// must call `restore_from_password`/`restore_from_recovery_key`.
    NeedsRestore {
        /// Set when this was reached via a detected key mismatch rather
        /// than a brand-new device.
        key_mismatch: bool,
    },
    /// No local identity keys and no backup either — the caller should
    /// call `generate_and_store_identity_keys`.
    KeysDoNotExist,
}

/// A sealed message ready for transport, or received over it.
///
/// Serializes to exactly the wire contract: `ciphertext` and `nonce`
/// as Base64 strings, `counter`/`epoch` as plain numbers. This is the only
/// type in the crate with a `Serialize`/`Deserialize` impl — everything
/// else stays inside the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// XSalsa20-Poly1305 ciphertext including the authentication tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// The nonce used to seal `ciphertext`.
    #[serde(with = "base64_nonce")]
    pub nonce: [u8; 24],
    /// The message counter the sender derived `ciphertext`'s key from.
    pub counter: u64,
    /// The identity epoch the session was established under.
    pub epoch: u32,
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_nonce {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(nonce: &[u8; 24], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 24], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must decode to exactly 24 bytes"))
    }
}

/// Current rotation/epoch state, as reported to the facade.
#[derive(Debug, Clone)]
pub struct RotationStatus {
    /// Whether a rotation is currently in flight on this device.
    pub in_progress: bool,
    /// The identity epoch currently in use.
    pub current_epoch: u32,
}

#[derive(Default)]
struct ManagerState {
    current_user: Option<String>,
    current_epoch: u32,
    session_backup_key: Option<[u8; 32]>,
    rotation_in_progress: bool,
    rotation_lock_token: Option<Uuid>,
}

/// Orchestrates the full key lifecycle for a single logical user on this
/// device.
pub struct KeyManager {
    local: Arc<LocalKeyStore>,
    remote: Arc<dyn RemoteKeyStore>,
    historical: Arc<HistoricalKeys>,
    backup: Arc<BackupManager>,
    conversation_directory: Arc<dyn ConversationDirectory>,
    hkdf_info_prefix: String,
    safety_number_config: SafetyNumberConfig,
    key_rotation: KeyRotationConfig,
    state: RwLock<ManagerState>,
    conversation_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyManager {
    /// Build a key manager over the given stores, configuration, and
    /// conversation directory collaborator.
    pub fn new(
        config: &EngineConfig,
        local: Arc<LocalKeyStore>,
        remote: Arc<dyn RemoteKeyStore>,
        conversation_directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        let historical = Arc::new(HistoricalKeys::new(local.clone(), remote.clone()));
        let backup = Arc::new(BackupManager::new(remote.clone(), config.pbkdf2.clone()));

        Self {
            local,
            remote,
            historical,
            backup,
            conversation_directory,
            hkdf_info_prefix: config.hkdf.info_prefix.clone(),
            safety_number_config: config.safety_number,
            key_rotation: config.key_rotation.clone(),
            state: RwLock::new(ManagerState::default()),
            conversation_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Initialize for user
    // ========================================================================

    /// Bring the manager up for `user_id`: reconcile local identity keys
    /// against the remote record (auto-repairing a missing remote row,
    /// surfacing a mismatch as a restore requirement), sync session
    /// backups if a session-backup key is already known, and sync every
    /// conversation partner's historical keys.
    pub async fn initialize_for_user(&self, user_id: &str) -> Result<InitializeOutcome> {
        let local_identity = match self.local.get_identity_keys(user_id)? {
            None => {
                return match self.remote.get_identity_backup(user_id).await? {
                    Some(_) => Ok(InitializeOutcome::NeedsRestore { key_mismatch: false }),
                    None => Ok(InitializeOutcome::KeysDoNotExist),
                };
            }
            Some(row) => row,
        };

        let starting_epoch = self.state.read().await.current_epoch;
        let epoch = match self.remote.get_identity_key(user_id).await? {
            None => {
                // Auto-repair: we have local keys the remote has never heard of.
                self.remote
                    .upsert_identity_key(user_id, &local_identity.public_key, starting_epoch)
                    .await?;
                self.historical.store(user_id, starting_epoch, &local_identity.public_key).await?;
                starting_epoch
            }
            Some(remote_row) if remote_row.public_key == local_identity.public_key => remote_row.current_epoch,
            Some(remote_row) => {
                self.local.delete_identity_keys(user_id)?;
                match self.remote.get_identity_backup(user_id).await? {
                    Some(_) => return Ok(InitializeOutcome::NeedsRestore { key_mismatch: true }),
                    None => {
                        self.historical.store(user_id, remote_row.current_epoch, &remote_row.public_key).await?;
                        let (sk, pk) = primitives::generate_identity_keypair();
                        let epoch = remote_row.current_epoch + 1;
                        self.local.put_identity_keys(&IdentityKeyRow {
                            user_id: user_id.to_string(),
                            public_key: pk,
                            secret_key: *sk.as_bytes(),
                            created_at: crate::time::now_timestamp(),
                        })?;
                        self.remote.upsert_identity_key(user_id, &pk, epoch).await?;
                        self.historical.store(user_id, epoch, &pk).await?;
                        epoch
                    }
                }
            }
        };

        {
            let mut state = self.state.write().await;
            state.current_user = Some(user_id.to_string());
            state.current_epoch = epoch;
        }

        let session_backup_key = self.state.read().await.session_backup_key;
        if let Some(backup_key) = session_backup_key {
            self.sync_session_backups_to_local(user_id, &backup_key).await?;
        }

        self.historical.sync_user_to_local(user_id).await?;
        self.sync_partner_keys(user_id).await;

        if self.key_rotation.enabled && self.key_rotation.check_on_init {
            let due = self.is_rotation_due(local_identity.created_at);
            if due {
                if let Err(err) = self.rotate_keys(user_id).await {
                    tracing::warn!(user = user_id, error = %err, "auto-rotation on initialize failed");
                }
            }
        }

        Ok(InitializeOutcome::Ready)
    }

    async fn sync_session_backups_to_local(&self, user_id: &str, backup_key: &[u8; 32]) -> Result<()> {
        let (restored, failed) = self.backup.restore_session_keys(user_id, backup_key).await?;
        for failure in &failed {
            tracing::warn!(
                user = user_id,
                conversation = failure.conversation_id,
                epoch = failure.epoch,
                error = %failure.error,
                "session backup row failed to restore"
            );
        }
        for row in restored {
            self.local.put_session_key(&SessionKeyRow {
                conversation_id: row.conversation_id,
                epoch: row.epoch,
                session_key: row.session_key,
                counter: row.counter,
                created_at: crate::time::now_timestamp(),
            })?;
        }
        Ok(())
    }

    /// Sync every conversation partner's historical keys. Failures are
    /// logged per-peer and never abort the caller.
    async fn sync_partner_keys(&self, user_id: &str) {
        match self.conversation_directory.list_partner_ids(user_id).await {
            Ok(partners) => {
                for partner_id in partners {
                    if let Err(err) = self.historical.sync_user_to_local(&partner_id).await {
                        tracing::warn!(user = user_id, partner = partner_id, error = %err, "failed to sync partner historical keys");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(user = user_id, error = %err, "failed to enumerate conversation partners");
            }
        }
    }

    // ========================================================================
    // Generate and store identity keys (no backup)
    // ========================================================================

    /// Generate a fresh identity key pair at epoch 0 and publish it.
    /// Clears any local session keys, since they were derived under
    /// whatever identity used to occupy this slot. Propagates remote
    /// failures — an identity key that can't be published isn't usable.
    pub async fn generate_and_store_identity_keys(&self, user_id: &str) -> Result<()> {
        self.local.clear_session_keys()?;

        let (sk, pk) = primitives::generate_identity_keypair();
        self.local.put_identity_keys(&IdentityKeyRow {
            user_id: user_id.to_string(),
            public_key: pk,
            secret_key: *sk.as_bytes(),
            created_at: crate::time::now_timestamp(),
        })?;

        self.remote.upsert_identity_key(user_id, &pk, 0).await?;
        self.historical.store(user_id, 0, &pk).await?;
        self.sync_partner_keys(user_id).await;

        let mut state = self.state.write().await;
        state.current_user = Some(user_id.to_string());
        state.current_epoch = 0;
        Ok(())
    }

    // ========================================================================
    // Create dual backup
    // ========================================================================

    /// Create an identity backup with a caller-chosen password and
    /// recovery key, immediately after `generate_and_store_identity_keys`.
    /// Installs the returned session-backup key and marks the manager
    /// initialized for `user_id`.
    pub async fn create_dual_backup(
        &self,
        user_id: &str,
        password: &str,
        recovery_key: &[u8; 32],
    ) -> Result<IdentityBackupCreated> {
        let local = self.local.get_identity_keys(user_id)?.ok_or(Error::NoLocalKeys)?;
        let created = self
            .backup
            .create_identity_backup_with_recovery_key(user_id, &local.secret_key, password, recovery_key)
            .await?;

        let mut state = self.state.write().await;
        state.current_user = Some(user_id.to_string());
        state.session_backup_key = Some(created.session_backup_key);
        Ok(created)
    }

    // ========================================================================
    // Restore from password / recovery key
    // ========================================================================

    /// Restore the identity secret from the password-protected backup,
    /// re-derive and trust the public key from it (never the remote
    /// blindly), and restore the session-backup key and session records
    /// if present.
    pub async fn restore_from_password(&self, user_id: &str, password: &str) -> Result<()> {
        self.local.clear_session_keys()?;
        let sk = self.backup.restore_from_password(user_id, password).await?;
        self.finish_restore(user_id, &sk).await?;

        if let Some(backup_key) = self.backup.restore_session_backup_key(user_id, password).await? {
            self.sync_session_backups_to_local(user_id, &backup_key).await?;
            let mut state = self.state.write().await;
            state.session_backup_key = Some(backup_key);
        }

        Ok(())
    }

    /// Restore the identity secret from the recovery-key-protected
    /// backup. The session-backup key cannot be recovered via this path
    /// — sessions lazily re-derive via ECDH as they're used.
    pub async fn restore_from_recovery_key(&self, user_id: &str, recovery_key: &[u8; 32]) -> Result<()> {
        self.local.clear_session_keys()?;
        let sk = self.backup.restore_from_recovery_key(user_id, recovery_key).await?;
        self.finish_restore(user_id, &sk).await
    }

    async fn finish_restore(&self, user_id: &str, sk: &[u8; 32]) -> Result<()> {
        let pk = primitives::derive_public(sk);

        let epoch = match self.remote.get_identity_key(user_id).await? {
            Some(remote_row) if remote_row.public_key == pk => remote_row.current_epoch,
            Some(remote_row) => {
                self.remote.upsert_identity_key(user_id, &pk, remote_row.current_epoch).await?;
                remote_row.current_epoch
            }
            None => {
                self.remote.upsert_identity_key(user_id, &pk, 0).await?;
                0
            }
        };
        self.historical.store(user_id, epoch, &pk).await?;

        self.local.put_identity_keys(&IdentityKeyRow {
            user_id: user_id.to_string(),
            public_key: pk,
            secret_key: *sk,
            created_at: crate::time::now_timestamp(),
        })?;

        let mut state = self.state.write().await;
        state.current_user = Some(user_id.to_string());
        state.current_epoch = epoch;
        Ok(())
    }

    // ========================================================================
    // Rotate identity keys
    // ========================================================================

    /// Rotate the identity key pair under a two-layer lock: an
    /// in-process flag plus a 60s remote lease, so at most one device
    /// rotates at a time. Fails with [`Error::RotationInProgress`] if
    /// either layer is already held.
    pub async fn rotate_keys(&self, user_id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.rotation_in_progress {
                return Err(Error::RotationInProgress);
            }
            state.rotation_in_progress = true;
        }

        let result = self.rotate_keys_locked(user_id).await;

        {
            let mut state = self.state.write().await;
            state.rotation_in_progress = false;
            state.rotation_lock_token = None;
        }

        result
    }

    async fn rotate_keys_locked(&self, user_id: &str) -> Result<()> {
        let token = Uuid::new_v4();
        let now = crate::time::now_timestamp();
        let acquired = self
            .remote
            .acquire_rotation_lock(user_id, token, ROTATION_LEASE_SECONDS, now)
            .await?;
        if !acquired {
            return Err(Error::RotationInProgress);
        }
        self.state.write().await.rotation_lock_token = Some(token);

        let outcome = self.do_rotate(user_id).await;

        // Always release, even on failure — an abandoned lease just sits
        // until its TTL expires, blocking other devices unnecessarily.
        if let Err(release_err) = self.remote.release_rotation_lock(user_id, token).await {
            tracing::warn!(user = user_id, error = %release_err, "failed to release rotation lease");
        }

        outcome
    }

    async fn do_rotate(&self, user_id: &str) -> Result<()> {
        let local = self.local.get_identity_keys(user_id)?.ok_or(Error::NoLocalKeys)?;
        let epoch_old = self.state.read().await.current_epoch;

        self.historical.store(user_id, epoch_old, &local.public_key).await?;

        let (sk_new, pk_new) = primitives::generate_identity_keypair();
        let epoch_new = epoch_old + 1;

        self.local.put_identity_keys(&IdentityKeyRow {
            user_id: user_id.to_string(),
            public_key: pk_new,
            secret_key: *sk_new.as_bytes(),
            created_at: crate::time::now_timestamp(),
        })?;
        self.remote.upsert_identity_key(user_id, &pk_new, epoch_new).await?;
        self.historical.store(user_id, epoch_new, &pk_new).await?;

        // The session-backup key is unchanged — that's the reason it
        // exists separately from the identity key. Session backups need
        // no re-encryption on rotation.
        self.state.write().await.current_epoch = epoch_new;
        Ok(())
    }

    fn is_rotation_due(&self, last_rotated_at: i64) -> bool {
        let interval_ms = self
            .key_rotation
            .interval_ms
            .clamp(self.key_rotation.min_interval_ms, self.key_rotation.max_interval_ms);
        let now = crate::time::now_timestamp();
        let elapsed_ms = (now - last_rotated_at).max(0) as u64 * 1000;
        elapsed_ms >= interval_ms
    }

    // ========================================================================
    // Establish session
    // ========================================================================

    /// Establish (or return the already-established) session for a
    /// conversation: `(session_key, epoch, counter)`. Production
    /// configuration fixes `epoch` to 0; the session_keys table still
    /// keys on `(conversation, epoch)` so a future per-epoch rollout
    /// needs no schema change.
    pub async fn establish_session(&self, conversation_id: &str, other_user_id: &str) -> Result<([u8; 32], u32, u64)> {
        if let Some(existing) = self.local.get_session_key(conversation_id, SESSION_EPOCH)? {
            return Ok((existing.session_key, existing.epoch, existing.counter));
        }

        let user_id = self.require_current_user().await?;
        let their_pk = self
            .historical
            .get_current(other_user_id)
            .await?
            .ok_or_else(|| Error::NoRemotePublicKey(other_user_id.to_string()))?;
        let local = self.local.get_identity_keys(&user_id)?.ok_or(Error::NoLocalKeys)?;

        let shared = primitives::ecdh(&local.secret_key, &their_pk);
        let session_key = kdf::derive_session_key(&shared, SESSION_EPOCH, &self.hkdf_info_prefix);

        self.local.put_session_key(&SessionKeyRow {
            conversation_id: conversation_id.to_string(),
            epoch: SESSION_EPOCH,
            session_key,
            counter: 0,
            created_at: crate::time::now_timestamp(),
        })?;

        let backup_key = self.state.read().await.session_backup_key;
        if let Some(backup_key) = backup_key {
            self.backup
                .backup_session_key(&user_id, conversation_id, &session_key, SESSION_EPOCH, &backup_key, 0)
                .await?;
        }

        Ok((session_key, SESSION_EPOCH, 0))
    }

    // ========================================================================
    // Encrypt
    // ========================================================================

    /// Seal `plaintext` for `conversation_id`'s established session.
    /// Serialized per conversation so two concurrent calls never race on
    /// the same counter.
    pub async fn encrypt(&self, conversation_id: &str, plaintext: &[u8]) -> Result<Envelope> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let user_id = self.require_current_user().await?;
        let session = self
            .local
            .get_session_key(conversation_id, SESSION_EPOCH)?
            .ok_or_else(|| Error::StorageNotFound(format!("no established session for conversation {conversation_id}")))?;

        if session.counter >= MAX_COUNTER {
            return Err(Error::CounterOverflow);
        }

        let message_key = kdf::derive_message_key(&session.session_key, session.epoch, session.counter, &self.hkdf_info_prefix);
        let nonce = primitives::random_nonce();
        let ciphertext = primitives::aead_seal(&message_key, &nonce, plaintext);
        let counter_used = session.counter;

        let new_counter = self.local.increment_counter(conversation_id, session.epoch)?;

        if let Err(err) = self
            .remote
            .update_session_backup_counter(&user_id, conversation_id, session.epoch, new_counter)
            .await
        {
            tracing::warn!(conversation = conversation_id, error = %err, "best-effort remote counter push failed");
        }

        Ok(Envelope {
            ciphertext,
            nonce,
            counter: counter_used,
            epoch: session.epoch,
        })
    }

    // ========================================================================
    // Decrypt with auto-repair
    // ========================================================================

    /// Open `envelope` sent in `conversation_id`. If the cached session
    /// for `(conversation, envelope.epoch)` fails to authenticate, the
    /// cache is invalidated, the session is re-derived via ECDH, and the
    /// open is retried exactly once before propagating the failure.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        envelope: &Envelope,
        sender_id: &str,
        recipient_id: &str,
    ) -> Result<Vec<u8>> {
        if envelope.counter >= MAX_COUNTER {
            return Err(Error::CounterOverflow);
        }

        let user_id = self.require_current_user().await?;
        let peer_id = if sender_id == user_id { recipient_id } else { sender_id };

        let (session_key, used_cached) = match self.local.get_session_key(conversation_id, envelope.epoch)? {
            Some(row) => (row.session_key, true),
            None => (
                self.derive_session_for_decrypt(&user_id, conversation_id, peer_id, envelope.epoch).await?,
                false,
            ),
        };

        let message_key = kdf::derive_message_key(&session_key, envelope.epoch, envelope.counter, &self.hkdf_info_prefix);

        match primitives::aead_open(&message_key, &envelope.nonce, &envelope.ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(open_err) => {
                if !used_cached {
                    return Err(open_err);
                }

                tracing::warn!(conversation = conversation_id, "cached session failed to authenticate, re-deriving and retrying once");
                self.local.delete_session_key(conversation_id, envelope.epoch)?;
                let session_key = self.derive_session_for_decrypt(&user_id, conversation_id, peer_id, envelope.epoch).await?;
                let message_key = kdf::derive_message_key(&session_key, envelope.epoch, envelope.counter, &self.hkdf_info_prefix);
                primitives::aead_open(&message_key, &envelope.nonce, &envelope.ciphertext)
            }
        }
    }

    async fn derive_session_for_decrypt(
        &self,
        user_id: &str,
        conversation_id: &str,
        peer_id: &str,
        epoch: u32,
    ) -> Result<[u8; 32]> {
        let their_pk = self
            .historical
            .get(peer_id, epoch)
            .await?
            .ok_or_else(|| Error::NoRemotePublicKey(peer_id.to_string()))?;
        let local = self.local.get_identity_keys(user_id)?.ok_or(Error::NoLocalKeys)?;

        let shared = primitives::ecdh(&local.secret_key, &their_pk);
        let session_key = kdf::derive_session_key(&shared, epoch, &self.hkdf_info_prefix);

        self.local.put_session_key(&SessionKeyRow {
            conversation_id: conversation_id.to_string(),
            epoch,
            session_key,
            counter: 0,
            created_at: crate::time::now_timestamp(),
        })?;

        Ok(session_key)
    }

    // ========================================================================
    // Facade support
    // ========================================================================

    /// The safety number between the current user and `peer_id`.
    pub async fn safety_number(&self, peer_id: &str) -> Result<String> {
        let user_id = self.require_current_user().await?;
        let local = self.local.get_identity_keys(&user_id)?.ok_or(Error::NoLocalKeys)?;
        let their_pk = self
            .historical
            .get_current(peer_id)
            .await?
            .ok_or_else(|| Error::NoRemotePublicKey(peer_id.to_string()))?;
        Ok(primitives::safety_number(&local.public_key, &their_pk, &self.safety_number_config))
    }

    /// The current user's own key fingerprint.
    pub async fn our_fingerprint(&self) -> Result<String> {
        let user_id = self.require_current_user().await?;
        let local = self.local.get_identity_keys(&user_id)?.ok_or(Error::NoLocalKeys)?;
        Ok(primitives::key_fingerprint(&local.public_key))
    }

    /// Current rotation/epoch state.
    pub async fn rotation_status(&self) -> RotationStatus {
        let state = self.state.read().await;
        RotationStatus {
            in_progress: state.rotation_in_progress,
            current_epoch: state.current_epoch,
        }
    }

    /// Wipe every local table and reset in-memory state. Remote data is
    /// untouched — this is a local-device reset, not an account deletion.
    pub async fn clear_local_data(&self) -> Result<()> {
        self.local.clear_all()?;
        *self.state.write().await = ManagerState::default();
        Ok(())
    }

    async fn require_current_user(&self) -> Result<String> {
        self.state.read().await.current_user.clone().ok_or(Error::NotInitialized)
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryConversationDirectory;
    use crate::store::remote::SqliteRemoteKeyStore;

    async fn manager() -> KeyManager {
        let config = EngineConfig::default();
        let local = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let directory: Arc<dyn ConversationDirectory> = Arc::new(InMemoryConversationDirectory::new());
        KeyManager::new(&config, local, remote, directory)
    }

    #[test]
    fn test_envelope_wire_format_is_base64_json() {
        let envelope = Envelope {
            ciphertext: vec![1, 2, 3, 4],
            nonce: [9u8; 24],
            counter: 7,
            epoch: 2,
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["counter"], 7);
        assert_eq!(json["epoch"], 2);
        assert!(json["ciphertext"].is_string());
        assert!(json["nonce"].is_string());

        let round_tripped: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped.ciphertext, envelope.ciphertext);
        assert_eq!(round_tripped.nonce, envelope.nonce);
        assert_eq!(round_tripped.counter, envelope.counter);
        assert_eq!(round_tripped.epoch, envelope.epoch);
    }

    #[tokio::test]
    async fn test_initialize_fresh_user_needs_generation() {
        let mgr = manager().await;
        let outcome = mgr.initialize_for_user("alice").await.unwrap();
        assert_eq!(outcome, InitializeOutcome::KeysDoNotExist);
    }

    #[tokio::test]
    async fn test_generate_then_initialize_is_ready() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();

        let outcome = mgr.initialize_for_user("alice").await.unwrap();
        assert_eq!(outcome, InitializeOutcome::Ready);
    }

    #[tokio::test]
    async fn test_needs_restore_when_backup_exists_but_no_local_keys() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();
        let rk = crate::crypto::password::generate_recovery_key();
        mgr.create_dual_backup("alice", "Hunter2!Abc", &rk).await.unwrap();

        mgr.local.clear_all().unwrap();

        let outcome = mgr.initialize_for_user("alice").await.unwrap();
        assert_eq!(outcome, InitializeOutcome::NeedsRestore { key_mismatch: false });
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip_between_two_users() {
        let config = EngineConfig::default();
        let local_alice = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let local_bob = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let directory: Arc<dyn ConversationDirectory> = Arc::new(InMemoryConversationDirectory::new());

        let alice = KeyManager::new(&config, local_alice, remote.clone(), directory.clone());
        let bob = KeyManager::new(&config, local_bob, remote, directory);

        alice.generate_and_store_identity_keys("alice").await.unwrap();
        bob.generate_and_store_identity_keys("bob").await.unwrap();

        alice.establish_session("c1", "bob").await.unwrap();
        bob.establish_session("c1", "alice").await.unwrap();

        let envelope = alice.encrypt("c1", b"hello bob").await.unwrap();
        let plaintext = bob.decrypt("c1", &envelope, "alice", "bob").await.unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[tokio::test]
    async fn test_encrypt_without_session_fails() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();
        let result = mgr.encrypt("c1", b"hi").await;
        assert!(matches!(result, Err(Error::StorageNotFound(_))));
    }

    #[tokio::test]
    async fn test_rotate_keys_bumps_epoch_and_archives_history() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();
        let old_pk = mgr.local.get_identity_keys("alice").unwrap().unwrap().public_key;

        mgr.rotate_keys("alice").await.unwrap();

        let status = mgr.rotation_status().await;
        assert_eq!(status.current_epoch, 1);
        assert!(!status.in_progress);

        let archived = mgr.historical.get("alice", 0).await.unwrap();
        assert_eq!(archived, Some(old_pk));
    }

    #[tokio::test]
    async fn test_concurrent_rotation_fails_with_in_progress() {
        let mgr = Arc::new(manager().await);
        mgr.generate_and_store_identity_keys("alice").await.unwrap();

        let mgr2 = mgr.clone();
        let handle = tokio::spawn(async move { mgr2.rotate_keys("alice").await });

        // The in-process flag check happens synchronously at the top of
        // rotate_keys, so a second call made while the first still holds
        // the flag observes RotationInProgress.
        let second = mgr.rotate_keys("alice").await;
        let first = handle.await.unwrap();

        let results = [first, second];
        assert!(results.iter().any(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_three_messages_have_distinct_monotonic_counters() {
        let config = EngineConfig::default();
        let local_alice = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let local_bob = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let directory: Arc<dyn ConversationDirectory> = Arc::new(InMemoryConversationDirectory::new());

        let alice = KeyManager::new(&config, local_alice, remote.clone(), directory.clone());
        let bob = KeyManager::new(&config, local_bob, remote, directory);
        alice.generate_and_store_identity_keys("alice").await.unwrap();
        bob.generate_and_store_identity_keys("bob").await.unwrap();
        alice.establish_session("c1", "bob").await.unwrap();
        bob.establish_session("c1", "alice").await.unwrap();

        let mut envelopes = Vec::new();
        for msg in ["m1", "m2", "m3"] {
            envelopes.push(alice.encrypt("c1", msg.as_bytes()).await.unwrap());
        }

        let counters: Vec<u64> = envelopes.iter().map(|e| e.counter).collect();
        assert_eq!(counters, vec![0, 1, 2]);

        for (envelope, expected) in envelopes.iter().zip(["m1", "m2", "m3"]) {
            let plaintext = bob.decrypt("c1", envelope, "alice", "bob").await.unwrap();
            assert_eq!(plaintext, expected.as_bytes());
        }

        let message_keys: Vec<[u8; 32]> = envelopes
            .iter()
            .map(|e| {
                kdf::derive_message_key(
                    &alice.local.get_session_key("c1", e.epoch).unwrap().unwrap().session_key,
                    e.epoch,
                    e.counter,
                    &alice.hkdf_info_prefix,
                )
            })
            .collect();
        assert_ne!(message_keys[0], message_keys[1]);
        assert_ne!(message_keys[1], message_keys[2]);
        assert_ne!(message_keys[0], message_keys[2]);
    }

    #[tokio::test]
    async fn test_key_mismatch_with_no_backup_auto_repairs() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();

        // Simulate another device publishing a different identity for
        // "alice" without this device's knowledge: rewrite the remote
        // current public key directly, bypassing the local store.
        let (_, other_pk) = primitives::generate_identity_keypair();
        mgr.remote.upsert_identity_key("alice", &other_pk, 5).await.unwrap();

        let outcome = mgr.initialize_for_user("alice").await.unwrap();
        assert_eq!(outcome, InitializeOutcome::Ready);

        // Local keys were cleared and a fresh pair generated, archived
        // the old remote public key into history at the old epoch, and
        // published the new one at epoch_old + 1.
        let status = mgr.rotation_status().await;
        assert_eq!(status.current_epoch, 6);
        let archived = mgr.historical.get("alice", 5).await.unwrap();
        assert_eq!(archived, Some(other_pk));

        let local = mgr.local.get_identity_keys("alice").unwrap().unwrap();
        let remote_row = mgr.remote.get_identity_key("alice").await.unwrap().unwrap();
        assert_eq!(local.public_key, remote_row.public_key);
        assert_ne!(local.public_key, other_pk);
    }

    #[tokio::test]
    async fn test_stale_cached_session_auto_repairs_on_decrypt() {
        let config = EngineConfig::default();
        let local_alice = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let local_bob = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let directory: Arc<dyn ConversationDirectory> = Arc::new(InMemoryConversationDirectory::new());

        let alice = KeyManager::new(&config, local_alice, remote.clone(), directory.clone());
        let bob = KeyManager::new(&config, local_bob, remote, directory);
        alice.generate_and_store_identity_keys("alice").await.unwrap();
        bob.generate_and_store_identity_keys("bob").await.unwrap();
        alice.establish_session("c1", "bob").await.unwrap();

        let envelope = alice.encrypt("c1", b"hello bob").await.unwrap();

        // Plant a corrupted session record for (c1, epoch 0) on bob's
        // device before he ever derives the real one via ECDH.
        bob.local
            .put_session_key(&SessionKeyRow {
                conversation_id: "c1".to_string(),
                epoch: 0,
                session_key: [0xAB; 32],
                counter: 0,
                created_at: crate::time::now_timestamp(),
            })
            .unwrap();

        let plaintext = bob.decrypt("c1", &envelope, "alice", "bob").await.unwrap();
        assert_eq!(plaintext, b"hello bob");

        // The repaired session is now cached under the correct key.
        let repaired = bob.local.get_session_key("c1", 0).unwrap().unwrap();
        assert_ne!(repaired.session_key, [0xAB; 32]);
    }

    #[tokio::test]
    async fn test_clear_local_data_resets_state() {
        let mgr = manager().await;
        mgr.generate_and_store_identity_keys("alice").await.unwrap();
        mgr.clear_local_data().await.unwrap();

        assert!(mgr.local.get_identity_keys("alice").unwrap().is_none());
        assert!(matches!(mgr.require_current_user().await, Err(Error::NotInitialized)));
    }
}
