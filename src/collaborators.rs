//! # Collaborator interfaces
//!
//! The engine talks to the rest of the host application through three
//! narrow async traits rather than reaching into the host's conversation
//! table, auth system, or billing state directly. [`crate::manager::KeyManager`]
//! is generic over these so a host can supply its own implementations;
//! the in-memory ones here exist for tests and as a usage example.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;

/// Resolves which peers a user shares a conversation with, so
/// [`crate::manager::KeyManager`] can keep their historical public keys
/// synced locally without the engine owning the conversation schema.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// List the distinct user IDs `user_id` shares at least one
    /// conversation with.
    async fn list_partner_ids(&self, user_id: &str) -> Result<Vec<String>>;
}

/// Identifies the caller's current user. The engine never authenticates
/// anyone itself — this just answers "who is asking".
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The currently authenticated user's ID, if any.
    async fn current_user_id(&self) -> Result<Option<String>>;

    /// Whether a caller is authenticated at all.
    async fn is_authenticated(&self) -> Result<bool>;
}

/// Optional gate on a subscription tier required to use the engine. The
/// engine never interprets tier names; it only asks whether a user holds
/// the one named in [`crate::config::EngineConfig::required_tier`].
#[async_trait]
pub trait SubscriptionGuard: Send + Sync {
    /// Whether `user_id` holds at least `tier`.
    async fn has_tier(&self, user_id: &str, tier: &str) -> Result<bool>;
}

/// In-memory [`ConversationDirectory`] keyed by a fixed partner list per
/// user. Used in tests and as a minimal standalone example.
#[derive(Default)]
pub struct InMemoryConversationDirectory {
    partners: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryConversationDirectory {
    /// Build an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user_id` shares a conversation with `partner_id`
    /// (symmetric: also recorded in the other direction).
    pub fn add_conversation(&self, user_id: &str, partner_id: &str) {
        let mut partners = self.partners.write().unwrap();
        partners.entry(user_id.to_string()).or_default().push(partner_id.to_string());
        partners.entry(partner_id.to_string()).or_default().push(user_id.to_string());
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryConversationDirectory {
    async fn list_partner_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let partners = self.partners.read().unwrap();
        let mut ids = partners.get(user_id).cloned().unwrap_or_default();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-memory [`AuthProvider`] that always reports a fixed user, or none.
pub struct StaticAuthProvider {
    user_id: Option<String>,
}

impl StaticAuthProvider {
    /// An auth provider that always reports `user_id` as current.
    pub fn authenticated_as(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    /// An auth provider that reports no current user.
    pub fn unauthenticated() -> Self {
        Self { user_id: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn current_user_id(&self) -> Result<Option<String>> {
        Ok(self.user_id.clone())
    }

    async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.user_id.is_some())
    }
}

/// In-memory [`SubscriptionGuard`] that grants a fixed set of tiers per
/// user.
#[derive(Default)]
pub struct InMemorySubscriptionGuard {
    tiers: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemorySubscriptionGuard {
    /// Build a guard with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `tier` to `user_id`.
    pub fn grant(&self, user_id: &str, tier: &str) {
        self.tiers.write().unwrap().entry(user_id.to_string()).or_default().push(tier.to_string());
    }
}

#[async_trait]
impl SubscriptionGuard for InMemorySubscriptionGuard {
    async fn has_tier(&self, user_id: &str, tier: &str) -> Result<bool> {
        let tiers = self.tiers.read().unwrap();
        Ok(tiers.get(user_id).map(|ts| ts.iter().any(|t| t == tier)).unwrap_or(false))
    }
}
