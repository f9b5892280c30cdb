//! # End-to-end encryption engine for two-party conversations
//!
//! Per-user Curve25519 identity keys, ECDH-derived per-conversation
//! session keys, forward-secret per-message keys, epoch-based identity
//! rotation with a historical public-key cache, and password/recovery-key
//! protected backups of both the identity secret and session-key state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ENCRYPTION ENGINE MODULES                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  facade          EncryptionContext — the only surface a caller touches │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  manager         KeyManager — lifecycle, rotation, sessions, messages  │
//! │     │                                                                   │
//! │     ├──► historical   HistoricalKeys (local cache + remote history)    │
//! │     ├──► backup       BackupManager (password/recovery-key backups)    │
//! │     └──► store        LocalKeyStore (SQLite cache) / RemoteKeyStore    │
//! │                        (async_trait port, SqliteRemoteKeyStore ref)    │
//! │                                                                         │
//! │  crypto          primitives / kdf / password — the pure crypto layer   │
//! │  collaborators   ConversationDirectory / AuthProvider / SubscriptionGuard│
//! │  config          EngineConfig and friends                              │
//! │  error           categorized Error enum                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module hierarchy
//!
//! - [`facade`] — `EncryptionContext`, the narrow external contract
//! - [`manager`] — `KeyManager`, the orchestrator
//! - [`backup`] — identity and session-key backup/restore
//! - [`historical`] — two-tier historical public-key cache
//! - [`store`] — `LocalKeyStore` / `RemoteKeyStore`
//! - [`crypto`] — primitives, KDF, password-based cryptography
//! - [`collaborators`] — host-supplied conversation/auth/subscription ports
//! - [`config`] — typed engine configuration
//! - [`error`] — error types for the entire crate
//!
//! ## Non-goals
//!
//! This crate does not implement message transport, user authentication,
//! conversation or thread management, file attachments, subscription
//! gating policy, notification delivery, or schema migration of a host's
//! database — it is handed collaborator traits for the pieces of those
//! concerns it genuinely needs (who a user's conversation partners are,
//! who's currently authenticated, what subscription tier they hold) and
//! otherwise stays out of them.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod backup;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod error;
pub mod facade;
pub mod historical;
pub mod manager;
pub mod store;
/// Timestamp helpers shared by stores and backup records.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use facade::{EncryptionContext, InitializeResult};
pub use manager::Envelope;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
