//! # Configuration
//!
//! A typed configuration record, constructed once by the caller and passed
//! through every component constructor. There is no string-keyed lookup at
//! runtime: every recognized option from the external contract is a field
//! here, with the same defaults.

/// PBKDF2 parameters for password- and recovery-key-derived backup keys.
#[derive(Debug, Clone)]
pub struct Pbkdf2Config {
    /// Requested iteration count. Use [`Pbkdf2Config::effective_iterations`]
    /// rather than this field directly — it is never accepted below
    /// [`Pbkdf2Config::MIN_ITERATIONS`] regardless of what's stored here.
    pub iterations: u32,
    /// Derived key length in bits.
    pub key_length_bits: u32,
}

impl Pbkdf2Config {
    /// Floor on the iteration count regardless of what a caller requests.
    pub const MIN_ITERATIONS: u32 = 100_000;

    /// The iteration count actually used for a PBKDF2 call: `iterations`
    /// clamped up to [`Pbkdf2Config::MIN_ITERATIONS`]. This is what makes
    /// the floor hold even when a caller builds this struct directly with
    /// a lower value.
    pub fn effective_iterations(&self) -> u32 {
        self.iterations.max(Self::MIN_ITERATIONS)
    }
}

impl Default for Pbkdf2Config {
    fn default() -> Self {
        Self {
            iterations: 600_000,
            key_length_bits: 256,
        }
    }
}

/// HKDF domain-separation configuration.
#[derive(Debug, Clone)]
pub struct HkdfConfig {
    /// Application-identifying prefix mixed into every `info` string. Part
    /// of the wire contract: changing it invalidates every derived key for
    /// callers that don't match.
    pub info_prefix: String,
}

impl Default for HkdfConfig {
    fn default() -> Self {
        Self {
            info_prefix: "MoneyTracker".to_string(),
        }
    }
}

/// Safety-number formatting.
#[derive(Debug, Clone, Copy)]
pub struct SafetyNumberConfig {
    /// Number of space-separated digit groups.
    pub groups: usize,
    /// Digits per group.
    pub digits_per_group: usize,
}

impl Default for SafetyNumberConfig {
    fn default() -> Self {
        Self {
            groups: 6,
            digits_per_group: 5,
        }
    }
}

/// Key-rotation policy.
#[derive(Debug, Clone)]
pub struct KeyRotationConfig {
    /// Whether automatic rotation checks run at all.
    pub enabled: bool,
    /// Whether `initialize_for_user` checks rotation due-ness.
    pub check_on_init: bool,
    /// Target interval between rotations.
    pub interval_ms: u64,
    /// Lower clamp on the effective interval.
    pub min_interval_ms: u64,
    /// Upper clamp on the effective interval.
    pub max_interval_ms: u64,
}

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_on_init: false,
            interval_ms: 86_400_000,
            min_interval_ms: 3_600_000,
            max_interval_ms: 30 * 86_400_000,
        }
    }
}

/// Logical table names, in case a host schema renames them.
#[derive(Debug, Clone)]
pub struct TableNames {
    /// `identity_keys` table name.
    pub identity_keys: String,
    /// `public_key_history` table name.
    pub public_key_history: String,
    /// `identity_key_backups` table name.
    pub identity_key_backups: String,
    /// `conversation_session_keys` table name.
    pub conversation_session_keys: String,
    /// `key_rotation_locks` table name.
    pub key_rotation_locks: String,
    /// `conversations` table name, used for partner-key sync lookups.
    pub conversations: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            identity_keys: "identity_keys".to_string(),
            public_key_history: "public_key_history".to_string(),
            identity_key_backups: "identity_key_backups".to_string(),
            conversation_session_keys: "conversation_session_keys".to_string(),
            key_rotation_locks: "key_rotation_locks".to_string(),
            conversations: "conversations".to_string(),
        }
    }
}

/// Top-level engine configuration, passed to [`crate::facade::EncryptionContext::new`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// PBKDF2 parameters.
    pub pbkdf2: Pbkdf2Config,
    /// HKDF domain-separation parameters.
    pub hkdf: HkdfConfig,
    /// Safety-number formatting.
    pub safety_number: SafetyNumberConfig,
    /// Key-rotation policy.
    pub key_rotation: KeyRotationConfig,
    /// Table name overrides.
    pub tables: TableNames,
    /// Path to the local store's SQLite file. `None` opens an in-memory
    /// database, used in tests.
    pub local_store_path: Option<String>,
    /// Subscription tier required to use the engine, if gated. The engine
    /// itself never evaluates this — it is handed to the injected
    /// [`crate::collaborators::SubscriptionGuard`] by the caller.
    pub required_tier: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pbkdf2.iterations, 600_000);
        assert_eq!(cfg.pbkdf2.key_length_bits, 256);
        assert_eq!(cfg.hkdf.info_prefix, "MoneyTracker");
        assert_eq!(cfg.safety_number.groups, 6);
        assert_eq!(cfg.safety_number.digits_per_group, 5);
        assert!(!cfg.key_rotation.enabled);
        assert!(!cfg.key_rotation.check_on_init);
        assert_eq!(cfg.key_rotation.interval_ms, 86_400_000);
    }
}
