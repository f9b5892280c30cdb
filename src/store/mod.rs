//! # Storage
//!
//! Two persistence tiers:
//!
//! - [`local`]: `LocalKeyStore`, a private on-device SQLite cache of
//!   identity keys, session keys (with their message counters), and
//!   historical public keys.
//! - [`remote`]: `RemoteKeyStore`, an `async_trait` port over the
//!   authoritative records — current public key, public-key history,
//!   identity backups, session-key backups, and rotation locks — plus a
//!   self-contained reference implementation (`SqliteRemoteKeyStore`) so
//!   the engine is testable without a live network service.
//!
//! Neither tier performs cryptography; they move bytes.

pub mod local;
pub mod remote;

pub use local::LocalKeyStore;
pub use remote::{RemoteKeyStore, SqliteRemoteKeyStore};
