//! # Facade
//!
//! `EncryptionContext` is the only surface the messaging layer is
//! permitted to touch. It owns the manager and its collaborators and
//! exposes nothing beyond `initialize`, the two restore paths, message
//! encrypt/decrypt, safety-number/fingerprint lookups, rotation, and a
//! local reset.
//!
//! Unlike the module this crate started from, there is no global
//! singleton here: `EncryptionContext` is an owned value a caller
//! constructs once per logical user session and holds for as long as it
//! needs it, which also makes it trivial to run more than one in the
//! same process (multi-account, tests).

use std::sync::Arc;

use crate::collaborators::ConversationDirectory;
use crate::config::EngineConfig;
use crate::crypto::password;
use crate::error::{Error, Result};
use crate::manager::{Envelope, InitializeOutcome, KeyManager, RotationStatus};
use crate::store::local::LocalKeyStore;
use crate::store::remote::RemoteKeyStore;

/// Outcome of [`EncryptionContext::initialize`], translated into the
/// three actions a caller needs to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeResult {
    /// Ready to encrypt/decrypt immediately.
    Ready,
    /// Call `restore_from_password` or `restore_from_recovery_key`.
    NeedsRestore {
        /// Whether this was triggered by a key mismatch (existing backup,
        /// different device state) rather than a first restore.
        key_mismatch: bool,
    },
    /// No backup exists either; the caller must generate a fresh
    /// identity (outside the facade's narrow surface — see
    /// [`KeyManager::generate_and_store_identity_keys`] via a host-side
    /// setup flow) before calling `initialize` again.
    NeedsSetup,
}

/// The narrow external contract over a [`KeyManager`] for one user
/// session on one device.
pub struct EncryptionContext {
    manager: KeyManager,
    user_id: String,
}

impl EncryptionContext {
    /// Construct a context over the given stores and configuration. Does
    /// not touch any key material until [`Self::initialize`] runs.
    pub fn new(
        config: &EngineConfig,
        local: Arc<LocalKeyStore>,
        remote: Arc<dyn RemoteKeyStore>,
        conversation_directory: Arc<dyn ConversationDirectory>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            manager: KeyManager::new(config, local, remote, conversation_directory),
            user_id: user_id.into(),
        }
    }

    /// Reconcile local and remote identity key state for this context's
    /// user. Must be called before any other operation.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        match self.manager.initialize_for_user(&self.user_id).await? {
            InitializeOutcome::Ready => Ok(InitializeResult::Ready),
            InitializeOutcome::NeedsRestore { key_mismatch } => Ok(InitializeResult::NeedsRestore { key_mismatch }),
            InitializeOutcome::KeysDoNotExist => Ok(InitializeResult::NeedsSetup),
        }
    }

    /// Restore the identity secret (and, if present, the session-backup
    /// key and cached sessions) from the password-protected backup.
    pub async fn restore_from_password(&self, password: &str) -> Result<()> {
        self.manager.restore_from_password(&self.user_id, password).await
    }

    /// Restore the identity secret from the recovery-key-protected
    /// backup. The recovery key is expected in its display form
    /// (`ABCD-EFGH-...`); parsing failures surface as
    /// [`Error::Internal`].
    pub async fn restore_from_recovery_key(&self, recovery_key_formatted: &str) -> Result<()> {
        let rk = password::parse_recovery_key(recovery_key_formatted)?;
        self.manager.restore_from_recovery_key(&self.user_id, &rk).await
    }

    /// Encrypt `plaintext` for `conversation_id`, establishing a session
    /// with `recipient_id` first if one doesn't already exist.
    pub async fn encrypt_message(&self, conversation_id: &str, plaintext: &[u8], recipient_id: &str) -> Result<Envelope> {
        self.manager.establish_session(conversation_id, recipient_id).await?;
        self.manager.encrypt(conversation_id, plaintext).await
    }

    /// Decrypt an envelope received in `conversation_id`.
    pub async fn decrypt_message(
        &self,
        conversation_id: &str,
        envelope: &Envelope,
        sender_id: &str,
        recipient_id: &str,
    ) -> Result<Vec<u8>> {
        self.manager.decrypt(conversation_id, envelope, sender_id, recipient_id).await
    }

    /// The safety number to display for verifying `peer_id`'s identity
    /// out of band.
    pub async fn get_safety_number(&self, peer_id: &str) -> Result<String> {
        self.manager.safety_number(peer_id).await
    }

    /// This context's own key fingerprint.
    pub async fn get_our_fingerprint(&self) -> Result<String> {
        self.manager.our_fingerprint().await
    }

    /// Rotate the identity key pair under the manager's distributed
    /// lease. See [`KeyManager::rotate_keys`].
    pub async fn rotate_keys(&self) -> Result<()> {
        self.manager.rotate_keys(&self.user_id).await
    }

    /// Current rotation/epoch state.
    pub async fn rotation_status(&self) -> RotationStatus {
        self.manager.rotation_status().await
    }

    /// Wipe all locally cached key material for this device. Remote
    /// state (backups, published keys) is untouched.
    pub async fn clear_local_data(&self) -> Result<()> {
        self.manager.clear_local_data().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryConversationDirectory;
    use crate::store::remote::SqliteRemoteKeyStore;

    async fn context(user_id: &str, remote: Arc<dyn RemoteKeyStore>) -> EncryptionContext {
        let config = EngineConfig::default();
        let local = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let directory: Arc<dyn ConversationDirectory> = Arc::new(InMemoryConversationDirectory::new());
        EncryptionContext::new(&config, local, remote, directory, user_id)
    }

    #[tokio::test]
    async fn test_initialize_needs_setup_on_fresh_user() {
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let ctx = context("alice", remote).await;
        assert_eq!(ctx.initialize().await.unwrap(), InitializeResult::NeedsSetup);
    }

    #[tokio::test]
    async fn test_two_contexts_exchange_a_message() {
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let alice = context("alice", remote.clone()).await;
        let bob = context("bob", remote).await;

        alice.manager.generate_and_store_identity_keys("alice").await.unwrap();
        bob.manager.generate_and_store_identity_keys("bob").await.unwrap();

        assert_eq!(alice.initialize().await.unwrap(), InitializeResult::Ready);
        assert_eq!(bob.initialize().await.unwrap(), InitializeResult::Ready);

        let envelope = alice.encrypt_message("c1", b"hey bob", "bob").await.unwrap();
        let plaintext = bob.decrypt_message("c1", &envelope, "alice", "bob").await.unwrap();
        assert_eq!(plaintext, b"hey bob");
    }

    #[tokio::test]
    async fn test_restore_from_recovery_key_round_trip() {
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        let ctx = context("alice", remote.clone()).await;
        ctx.manager.generate_and_store_identity_keys("alice").await.unwrap();

        let rk = password::generate_recovery_key();
        let created = ctx.manager.create_dual_backup("alice", "Hunter2!Abc", &rk).await.unwrap();

        let fresh = context("alice", remote).await;
        assert_eq!(fresh.initialize().await.unwrap(), InitializeResult::NeedsRestore { key_mismatch: false });
        fresh.restore_from_recovery_key(&created.recovery_key_formatted).await.unwrap();

        assert_eq!(fresh.get_our_fingerprint().await.unwrap(), ctx.get_our_fingerprint().await.unwrap());
    }
}
