//! # Password-Based Cryptography
//!
//! AES-256-GCM encryption under PBKDF2-derived keys, recovery-key
//! generation/formatting, and password strength scoring. This is the layer
//! [`crate::backup::BackupManager`] builds on to protect identity secrets
//! and the stable session-backup key.
//!
//! ## Why AES-256-GCM here and XSalsa20-Poly1305 elsewhere
//!
//! Messages and session-key backups use XSalsa20-Poly1305 (see
//! [`crate::crypto::primitives`]) because its 24-byte random nonce makes
//! nonce collisions practically impossible across a conversation's
//! lifetime. Backups are sealed once per password change rather than once
//! per message, so AES-256-GCM's 12-byte nonce is not a collision risk
//! here and is kept as the designated algorithm for this layer.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};

use crate::crypto::kdf;
use crate::error::{Error, Result};

/// Size of the PBKDF2 salt stored alongside each backup ciphertext.
pub const SALT_SIZE: usize = 32;
/// Size of the AES-GCM IV stored alongside each backup ciphertext.
pub const IV_SIZE: usize = 12;
/// Size of a recovery key, in raw bytes.
pub const RECOVERY_KEY_SIZE: usize = 32;

/// A password-backup ciphertext with its own salt and IV, as stored in
/// `identity_key_backups`.
#[derive(Debug, Clone)]
pub struct PasswordSealed {
    /// AES-256-GCM ciphertext including the authentication tag.
    pub ciphertext: Vec<u8>,
    /// PBKDF2 salt used to derive the key.
    pub salt: [u8; SALT_SIZE],
    /// AES-GCM IV.
    pub iv: [u8; IV_SIZE],
}

/// Encrypt `data` under a key derived from `password` via PBKDF2. Generates
/// a fresh random salt and IV.
pub fn encrypt_with_password(
    data: &[u8],
    password: &[u8],
    iterations: u32,
    key_length_bits: u32,
) -> Result<PasswordSealed> {
    let salt: [u8; SALT_SIZE] = crate::crypto::primitives::random_bytes(SALT_SIZE)
        .try_into()
        .expect("random_bytes(SALT_SIZE) returns SALT_SIZE bytes");
    let iv: [u8; IV_SIZE] = crate::crypto::primitives::random_bytes(IV_SIZE)
        .try_into()
        .expect("random_bytes(IV_SIZE) returns IV_SIZE bytes");

    let key = kdf::pbkdf2(password, &salt, iterations, key_length_bits)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("invalid derived key length: {}", e)))?;

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&iv), Payload { msg: data, aad: &[] })
        .map_err(|e| Error::Internal(format!("backup encryption failed: {}", e)))?;

    Ok(PasswordSealed { ciphertext, salt, iv })
}

/// Decrypt a [`PasswordSealed`] value under `password`. AEAD failure maps
/// to [`Error::AuthFail`] ("incorrect password or corrupted data").
pub fn decrypt_with_password(
    sealed: &PasswordSealed,
    password: &[u8],
    iterations: u32,
    key_length_bits: u32,
) -> Result<Vec<u8>> {
    let key = kdf::pbkdf2(password, &sealed.salt, iterations, key_length_bits)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("invalid derived key length: {}", e)))?;

    cipher
        .decrypt(
            AesNonce::from_slice(&sealed.iv),
            Payload {
                msg: &sealed.ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::AuthFail)
}

/// Generate a fresh 32-byte recovery key from the CSPRNG.
pub fn generate_recovery_key() -> [u8; RECOVERY_KEY_SIZE] {
    crate::crypto::primitives::random_bytes(RECOVERY_KEY_SIZE)
        .try_into()
        .expect("random_bytes(RECOVERY_KEY_SIZE) returns RECOVERY_KEY_SIZE bytes")
}

/// Format a raw recovery key for display: RFC 4648 Base32 (no padding) of
/// the raw bytes, grouped in 4-character blocks separated by `-`.
///
/// This is the canonical encoding path this crate uses (Open Question 1 in
/// the design notes): Base32 operates directly on the raw bytes, never on
/// an intermediate Base64 string. [`parse_recovery_key`] reverses exactly
/// this transform, and the same raw bytes are what gets fed to PBKDF2 as
/// the password input — so a formatted recovery key always unlocks the
/// backup it was generated alongside.
pub fn format_recovery_key(rk: &[u8; RECOVERY_KEY_SIZE]) -> String {
    let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, rk);
    encoded
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).expect("ASCII Base32 alphabet"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a user-entered recovery key back into raw bytes. Case-insensitive;
/// `-` separators are stripped before decoding.
pub fn parse_recovery_key(input: &str) -> Result<[u8; RECOVERY_KEY_SIZE]> {
    let stripped: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    let decoded = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &stripped)
        .ok_or_else(|| Error::Internal("recovery key is not valid Base32".into()))?;

    decoded
        .try_into()
        .map_err(|_| Error::Internal("recovery key must decode to exactly 32 bytes".into()))
}

/// Score a candidate password 0-6: length >= 8 (required to score at all),
/// length >= 12, lowercase, uppercase, digit, symbol. Accept when
/// `score >= 4 && length >= 8`.
pub fn score_password(password: &str) -> u8 {
    if password.len() < 8 {
        return 0;
    }

    let mut score: u8 = 1; // length >= 8
    if password.len() >= 12 {
        score += 1;
    }
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        score += 1;
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        score += 1;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        score += 1;
    }
    if password.chars().any(|c| !c.is_alphanumeric()) {
        score += 1;
    }
    score
}

/// Whether a candidate password meets the minimum bar for use as a backup
/// password: `score >= 4 && length >= 8`.
pub fn is_password_acceptable(password: &str) -> bool {
    password.len() >= 8 && score_password(password) >= 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let data = b"top secret identity key material";
        let sealed = encrypt_with_password(data, b"hunter2", 10_000, 256).unwrap();
        let decrypted = decrypt_with_password(&sealed, b"hunter2", 10_000, 256).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_wrong_password_fails() {
        let data = b"top secret identity key material";
        let sealed = encrypt_with_password(data, b"hunter2", 10_000, 256).unwrap();
        let result = decrypt_with_password(&sealed, b"wrong-password", 10_000, 256);
        assert!(matches!(result, Err(Error::AuthFail)));
    }

    #[test]
    fn test_recovery_key_format_round_trip() {
        let rk = generate_recovery_key();
        let formatted = format_recovery_key(&rk);
        let parsed = parse_recovery_key(&formatted).unwrap();
        assert_eq!(rk, parsed);
    }

    #[test]
    fn test_recovery_key_format_groups_of_four() {
        let rk = [0u8; RECOVERY_KEY_SIZE];
        let formatted = format_recovery_key(&rk);
        for group in formatted.split('-') {
            assert!(group.len() <= 4);
        }
    }

    #[test]
    fn test_recovery_key_parse_case_insensitive_and_ignores_dashes() {
        let rk = generate_recovery_key();
        let formatted = format_recovery_key(&rk);
        let lowered = formatted.to_lowercase().replace('-', "");
        assert_eq!(parse_recovery_key(&lowered).unwrap(), rk);
    }

    #[test]
    fn test_password_strength_scoring() {
        assert_eq!(score_password("short"), 0);
        assert!(score_password("alllowercase") < 4 || !is_password_acceptable("alllowercase"));
        assert!(is_password_acceptable("Hunter2!Abc"));
        assert!(!is_password_acceptable("1234567"));
    }
}
