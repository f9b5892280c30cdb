//! # Cryptographic Primitives
//!
//! Pure functions over byte slices. Nothing in this module touches storage
//! or performs I/O — everything here is synchronous and deterministic given
//! its inputs (aside from the CSPRNG-backed generators).
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          PRIMITIVES LAYER                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  generate_identity_keypair() / derive_public()                         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ecdh(my_sk, their_pk) ──► shared[32]  (X25519)                        │
//! │           │                                                             │
//! │           ▼  (crypto::kdf::derive_session_key, outside this module)     │
//! │  aead_seal / aead_open  (XSalsa20-Poly1305, 24-byte nonce)              │
//! │                                                                         │
//! │  sha512 / ct_eq / safety_number / key_fingerprint                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use xsalsa20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XSalsa20Poly1305,
};
use zeroize::ZeroizeOnDrop;

use crate::config::SafetyNumberConfig;
use crate::error::{Error, Result};

/// Size of an X25519 key (secret or public) in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of an XSalsa20-Poly1305 nonce in bytes (192 bits).
pub const NONCE_SIZE: usize = 24;

/// An identity secret key. Zeroized on drop; never serialized directly —
/// callers that need to persist it go through [`crate::backup`].
#[derive(ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Wrap raw bytes, e.g. restored from a backup.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes, for ECDH or backup encryption.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Generate a fresh Curve25519 identity keypair from the OS CSPRNG.
pub fn generate_identity_keypair() -> (SecretKey, [u8; KEY_SIZE]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519PublicKey::from(&secret);
    (SecretKey(secret.to_bytes()), public.to_bytes())
}

/// Derive the public key for a secret. Deterministic: must agree with
/// whatever [`generate_identity_keypair`] paired with the same secret.
pub fn derive_public(sk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = StaticSecret::from(*sk);
    X25519PublicKey::from(&secret).to_bytes()
}

/// X25519 Diffie-Hellman. `ecdh(sk_a, pk_b) == ecdh(sk_b, pk_a)`.
pub fn ecdh(my_sk: &[u8; KEY_SIZE], their_pk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = StaticSecret::from(*my_sk);
    let their_public = X25519PublicKey::from(*their_pk);
    secret.diffie_hellman(&their_public).to_bytes()
}

/// `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// A fresh 24-byte nonce for [`aead_seal`].
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under `key` with XSalsa20-Poly1305. The nonce must be
/// fresh per call — see [`random_nonce`].
pub fn aead_seal(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XSalsa20Poly1305::new_from_slice(key).expect("key is exactly 32 bytes");
    cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("XSalsa20-Poly1305 encryption cannot fail on valid key/nonce")
}

/// Open a ciphertext sealed with [`aead_seal`]. Fails with
/// [`Error::DecryptionFailed`] on tag mismatch (wrong key, tampered
/// ciphertext, or wrong nonce).
pub fn aead_open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new_from_slice(key).expect("key is exactly 32 bytes");
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".into()))
}

/// SHA-512 of arbitrary data.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Constant-time byte comparison.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Compute the safety number for a pair of public keys.
///
/// Sorts the two key byte strings lexicographically, concatenates, hashes
/// with SHA-512, and decimalizes the first `groups * digits_per_group`
/// bytes (`byte mod 10` each), grouping with single spaces. Symmetric in
/// its two inputs by construction — the sort happens before hashing.
pub fn safety_number(pk_a: &[u8; KEY_SIZE], pk_b: &[u8; KEY_SIZE], config: &SafetyNumberConfig) -> String {
    let (first, second) = if pk_a.as_slice() <= pk_b.as_slice() {
        (pk_a, pk_b)
    } else {
        (pk_b, pk_a)
    };

    let mut combined = Vec::with_capacity(KEY_SIZE * 2);
    combined.extend_from_slice(first);
    combined.extend_from_slice(second);

    let digest = sha512(&combined);
    let needed = config.groups * config.digits_per_group;
    debug_assert!(needed <= digest.len(), "safety number config exceeds SHA-512 output");

    let digits: Vec<u8> = digest[..needed].iter().map(|b| b % 10).collect();

    digits
        .chunks(config.digits_per_group)
        .map(|chunk| chunk.iter().map(|d| d.to_string()).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key fingerprint: first 8 bytes of SHA-512(public key), lowercase hex.
pub fn key_fingerprint(pk: &[u8; KEY_SIZE]) -> String {
    let digest = sha512(pk);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_determinism() {
        let (sk, pk) = generate_identity_keypair();
        assert_eq!(derive_public(sk.as_bytes()), pk);
    }

    #[test]
    fn test_ecdh_symmetry() {
        let (sk_a, pk_a) = generate_identity_keypair();
        let (sk_b, pk_b) = generate_identity_keypair();

        let shared_a = ecdh(sk_a.as_bytes(), &pk_b);
        let shared_b = ecdh(sk_b.as_bytes(), &pk_a);

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_aead_round_trip() {
        let key = [7u8; KEY_SIZE];
        let nonce = random_nonce();
        let plaintext = b"hello";

        let ciphertext = aead_seal(&key, &nonce, plaintext);
        let decrypted = aead_open(&key, &nonce, &ciphertext).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aead_integrity_ciphertext_bit_flip() {
        let key = [7u8; KEY_SIZE];
        let nonce = random_nonce();
        let mut ciphertext = aead_seal(&key, &nonce, b"hello");
        ciphertext[0] ^= 0xFF;

        assert!(aead_open(&key, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_aead_integrity_wrong_key() {
        let key = [7u8; KEY_SIZE];
        let wrong_key = [8u8; KEY_SIZE];
        let nonce = random_nonce();
        let ciphertext = aead_seal(&key, &nonce, b"hello");

        assert!(aead_open(&wrong_key, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_aead_integrity_wrong_nonce() {
        let key = [7u8; KEY_SIZE];
        let nonce = random_nonce();
        let mut wrong_nonce = nonce;
        wrong_nonce[0] ^= 0xFF;
        let ciphertext = aead_seal(&key, &nonce, b"hello");

        assert!(aead_open(&key, &wrong_nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_safety_number_symmetric() {
        let (_, pk_a) = generate_identity_keypair();
        let (_, pk_b) = generate_identity_keypair();
        let config = SafetyNumberConfig::default();

        assert_eq!(
            safety_number(&pk_a, &pk_b, &config),
            safety_number(&pk_b, &pk_a, &config)
        );
    }

    #[test]
    fn test_safety_number_format() {
        let (_, pk_a) = generate_identity_keypair();
        let (_, pk_b) = generate_identity_keypair();
        let config = SafetyNumberConfig::default();

        let number = safety_number(&pk_a, &pk_b, &config);
        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), config.groups);
        for group in groups {
            assert_eq!(group.len(), config.digits_per_group);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_safety_number_differs_for_distinct_keys() {
        let (_, pk_a) = generate_identity_keypair();
        let (_, pk_b) = generate_identity_keypair();
        let (_, pk_c) = generate_identity_keypair();
        let config = SafetyNumberConfig::default();

        assert_ne!(
            safety_number(&pk_a, &pk_b, &config),
            safety_number(&pk_a, &pk_c, &config)
        );
    }

    #[test]
    fn test_key_fingerprint_is_16_hex_chars() {
        let (_, pk) = generate_identity_keypair();
        let fingerprint = key_fingerprint(&pk);
        assert_eq!(fingerprint.len(), 16);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
