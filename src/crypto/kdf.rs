//! # Key Derivation Functions
//!
//! Derives session keys and per-message keys from an ECDH shared secret,
//! and password-derived keys for the backup layer.
//!
//! ## Derivation chain
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SESSION / MESSAGE KEY DERIVATION                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ECDH shared secret (32 bytes)                                        │
//! │           │                                                             │
//! │           ▼  HKDF-SHA256(ikm = shared, info = prefix|SessionKey|epoch) │
//! │  session_key (32 bytes)   ── shared by both parties for (conv, epoch)  │
//! │           │                                                             │
//! │           ▼  HKDF-SHA256(ikm = session_key,                           │
//! │                          info = prefix|MessageKey|epoch|counter)      │
//! │  message_key (32 bytes)   ── used exactly once                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `info` strings and their endianness are part of the wire contract:
//! two implementations that disagree on byte order silently derive
//! different keys and every message becomes undecryptable.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::{Error, Result};

/// Derive a per-(conversation, epoch) session key from an ECDH shared
/// secret. `info = "<prefix>|SessionKey|" || u32_be(epoch)`.
pub fn derive_session_key(shared_secret: &[u8; 32], epoch: u32, info_prefix: &str) -> [u8; 32] {
    let mut info = Vec::with_capacity(info_prefix.len() + 12 + 4);
    info.extend_from_slice(info_prefix.as_bytes());
    info.extend_from_slice(b"|SessionKey|");
    info.extend_from_slice(&epoch.to_be_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .expect("32 bytes is within HKDF-SHA256's output limit");
    key
}

/// Derive a per-message key from a session key, epoch, and counter.
/// `info = "<prefix>|MessageKey|" || u32_be(epoch) || u64_be(counter)`.
pub fn derive_message_key(
    session_key: &[u8; 32],
    epoch: u32,
    counter: u64,
    info_prefix: &str,
) -> [u8; 32] {
    let mut info = Vec::with_capacity(info_prefix.len() + 12 + 4 + 8);
    info.extend_from_slice(info_prefix.as_bytes());
    info.extend_from_slice(b"|MessageKey|");
    info.extend_from_slice(&epoch.to_be_bytes());
    info.extend_from_slice(&counter.to_be_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, session_key);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .expect("32 bytes is within HKDF-SHA256's output limit");
    key
}

/// PBKDF2-HMAC-SHA256 over `password` with `salt`, producing
/// `key_length_bits / 8` bytes. `iterations` is the caller's responsibility
/// to floor at [`crate::config::Pbkdf2Config::MIN_ITERATIONS`] — this
/// function trusts its argument so the config layer owns the one policy
/// decision.
pub fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32, key_length_bits: u32) -> Result<Vec<u8>> {
    if key_length_bits % 8 != 0 {
        return Err(Error::Internal(
            "pbkdf2 key_length_bits must be a multiple of 8".into(),
        ));
    }
    let mut key = vec![0u8; (key_length_bits / 8) as usize];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_deterministic() {
        let shared = [1u8; 32];
        let k1 = derive_session_key(&shared, 0, "App");
        let k2 = derive_session_key(&shared, 0, "App");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_session_key_differs_per_epoch() {
        let shared = [1u8; 32];
        let k0 = derive_session_key(&shared, 0, "App");
        let k1 = derive_session_key(&shared, 1, "App");
        assert_ne!(k0, k1);
    }

    #[test]
    fn test_session_key_differs_per_prefix() {
        let shared = [1u8; 32];
        let k_a = derive_session_key(&shared, 0, "AppA");
        let k_b = derive_session_key(&shared, 0, "AppB");
        assert_ne!(k_a, k_b);
    }

    #[test]
    fn test_message_key_differs_per_counter() {
        let session_key = [2u8; 32];
        let mk0 = derive_message_key(&session_key, 0, 0, "App");
        let mk1 = derive_message_key(&session_key, 0, 1, "App");
        let mk2 = derive_message_key(&session_key, 0, 2, "App");

        assert_ne!(mk0, mk1);
        assert_ne!(mk1, mk2);
        assert_ne!(mk0, mk2);
    }

    #[test]
    fn test_pbkdf2_deterministic_and_sized() {
        let key1 = pbkdf2(b"hunter2", b"salt-bytes", 10_000, 256).unwrap();
        let key2 = pbkdf2(b"hunter2", b"salt-bytes", 10_000, 256).unwrap();
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 32);
    }

    #[test]
    fn test_pbkdf2_differs_per_salt() {
        let key1 = pbkdf2(b"hunter2", b"salt-a", 10_000, 256).unwrap();
        let key2 = pbkdf2(b"hunter2", b"salt-b", 10_000, 256).unwrap();
        assert_ne!(key1, key2);
    }
}
