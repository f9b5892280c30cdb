//! # Cryptography Module
//!
//! All cryptographic primitives used by the encryption engine, layered
//! bottom to top:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  primitives   Curve25519 keygen/ECDH, XSalsa20-Poly1305 AEAD,          │
//! │               SHA-512, CSPRNG, constant-time compare, safety number   │
//! │                          │                                              │
//! │                          ▼                                              │
//! │  kdf          HKDF-SHA256 session/message keys, PBKDF2-SHA256          │
//! │                          │                                              │
//! │                          ▼                                              │
//! │  password     AES-256-GCM backup sealing, recovery-key                │
//! │               generation/formatting, password strength scoring        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm choices
//!
//! | Purpose | Algorithm | Why |
//! |---|---|---|
//! | Identity keys, ECDH | X25519 | Fast, small keys, well audited |
//! | Messages, session backups | XSalsa20-Poly1305 | 24-byte random nonce is collision-safe per call, no per-conversation counter needed |
//! | Password/recovery-key backups | AES-256-GCM | Sealed rarely (password change, rotation), hardware-accelerated |
//! | Session/message key derivation | HKDF-SHA256 | Domain-separated `info` strings give per-purpose independence |
//! | Password-derived keys | PBKDF2-SHA256 | Deliberately slow, tunable iteration count |
//!
//! ## Security considerations
//!
//! 1. Secret keys are zeroized on drop (`zeroize`).
//! 2. Nonces are always fresh from the CSPRNG, never derived or reused.
//! 3. AEAD failures are never silently retried with a different key —
//!    callers decide whether to attempt the one scoped auto-repair
//!    described in [`crate::manager`].

pub mod kdf;
pub mod password;
pub mod primitives;

pub use primitives::{KEY_SIZE, NONCE_SIZE};
