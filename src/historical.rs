//! # HistoricalKeys
//!
//! A two-tier cache over the append-only history of a user's past public
//! keys: a local SQLite cache in front of the authoritative remote store.
//! Reads check the cache first and fall back to the remote store only on
//! a cache miss, populating the cache on the way back. Writes go to the
//! remote store first, then the cache — a duplicate write (re-storing a
//! key for an epoch that's already recorded) is treated as success, per
//! the `ConstraintViolation` policy described in [`crate::error`].

use std::sync::Arc;

use crate::error::Result;
use crate::store::local::{HistoricalKeyRow, LocalKeyStore};
use crate::store::remote::RemoteKeyStore;

/// Read-through, write-through cache over a user's historical public keys.
pub struct HistoricalKeys {
    local: Arc<LocalKeyStore>,
    remote: Arc<dyn RemoteKeyStore>,
}

impl HistoricalKeys {
    /// Build a historical-key cache over the given local and remote stores.
    pub fn new(local: Arc<LocalKeyStore>, remote: Arc<dyn RemoteKeyStore>) -> Self {
        Self { local, remote }
    }

    /// Record that `user_id`'s public key was `public_key` during `epoch`.
    /// Writes through to the remote store first; a duplicate `(user_id,
    /// epoch)` pair there is swallowed by `RemoteKeyStore::insert_history`
    /// and never surfaced here. The local cache is then updated
    /// unconditionally, so a retried store after a remote timeout still
    /// converges.
    pub async fn store(&self, user_id: &str, epoch: u32, public_key: &[u8; 32]) -> Result<()> {
        self.remote.insert_history(user_id, epoch, public_key).await?;

        let row = HistoricalKeyRow {
            user_id: user_id.to_string(),
            epoch,
            public_key: *public_key,
            created_at: crate::time::now_timestamp(),
        };
        self.local.put_historical_key(&row)?;
        Ok(())
    }

    /// Look up the public key a user held during a given epoch. Checks the
    /// local cache first; on a miss, reads through to the remote store and
    /// populates the cache before returning.
    pub async fn get(&self, user_id: &str, epoch: u32) -> Result<Option<[u8; 32]>> {
        if let Some(cached) = self.local.get_historical_key(user_id, epoch)? {
            return Ok(Some(cached.public_key));
        }

        match self.remote.get_history(user_id, epoch).await {
            Ok(Some(public_key)) => {
                let row = HistoricalKeyRow {
                    user_id: user_id.to_string(),
                    epoch,
                    public_key,
                    created_at: crate::time::now_timestamp(),
                };
                self.local.put_historical_key(&row)?;
                Ok(Some(public_key))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::warn!(user = user_id, epoch, error = %err, "remote history lookup failed, serving cache miss as none");
                Ok(None)
            }
        }
    }

    /// Look up a user's current public key record and return its key,
    /// i.e. `get(user_id, current_epoch)` after resolving `current_epoch`
    /// from the remote identity-key record.
    pub async fn get_current(&self, user_id: &str) -> Result<Option<[u8; 32]>> {
        match self.remote.get_identity_key(user_id).await {
            Ok(Some(row)) => Ok(Some(row.public_key)),
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::warn!(user = user_id, error = %err, "remote identity lookup failed during get_current");
                Err(err)
            }
        }
    }

    /// Pull every remote historical record for a user into the local
    /// cache. Used after restoring from a backup, when the local cache
    /// starts empty but the remote history is intact.
    pub async fn sync_user_to_local(&self, user_id: &str) -> Result<()> {
        let remote_rows = self.remote.list_history(user_id).await?;
        for row in remote_rows {
            let local_row = HistoricalKeyRow {
                user_id: row.user_id,
                epoch: row.epoch,
                public_key: row.public_key,
                created_at: row.created_at,
            };
            self.local.put_historical_key(&local_row)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::remote::SqliteRemoteKeyStore;

    async fn fixture() -> HistoricalKeys {
        let local = Arc::new(LocalKeyStore::open(None).await.unwrap());
        let remote: Arc<dyn RemoteKeyStore> = Arc::new(SqliteRemoteKeyStore::open(None).await.unwrap());
        HistoricalKeys::new(local, remote)
    }

    #[tokio::test]
    async fn test_store_then_get_populates_cache() {
        let keys = fixture().await;
        keys.store("alice", 0, &[1u8; 32]).await.unwrap();

        assert!(keys.local.get_historical_key("alice", 0).unwrap().is_some());
        assert_eq!(keys.get("alice", 0).await.unwrap(), Some([1u8; 32]));
    }

    #[tokio::test]
    async fn test_duplicate_store_is_idempotent() {
        let keys = fixture().await;
        keys.store("alice", 0, &[1u8; 32]).await.unwrap();
        keys.store("alice", 0, &[1u8; 32]).await.unwrap();
        assert_eq!(keys.get("alice", 0).await.unwrap(), Some([1u8; 32]));
    }

    #[tokio::test]
    async fn test_get_reads_through_remote_on_cache_miss() {
        let keys = fixture().await;
        keys.remote.insert_history("bob", 3, &[9u8; 32]).await.unwrap();

        assert!(keys.local.get_historical_key("bob", 3).unwrap().is_none());
        assert_eq!(keys.get("bob", 3).await.unwrap(), Some([9u8; 32]));
        assert!(keys.local.get_historical_key("bob", 3).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let keys = fixture().await;
        assert_eq!(keys.get("nobody", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_user_to_local() {
        let keys = fixture().await;
        keys.remote.insert_history("carol", 0, &[1u8; 32]).await.unwrap();
        keys.remote.insert_history("carol", 1, &[2u8; 32]).await.unwrap();

        keys.sync_user_to_local("carol").await.unwrap();

        let cached = keys.local.list_historical_keys_by_user("carol").unwrap();
        assert_eq!(cached.len(), 2);
    }
}
