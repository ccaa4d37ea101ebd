//! # Cryptography Module
//!
//! Primitives shared by every safe-level component.
//!
//! ## Key Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    KEY HIERARCHY (per safe)                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Password + salt                                                       │
//! │        │ PBKDF2-HMAC-SHA256                                            │
//! │        ▼                                                                │
//! │  ┌─────────────────┐   encrypts   ┌─────────────────────────────────┐  │
//! │  │   Master Key    │─────────────►│ encTest (verification marker)   │  │
//! │  │ (memory only)   │              │ encIndexKey                     │  │
//! │  └─────────────────┘              │ encBubblesKey                   │  │
//! │        │                          │ encItemEditionKey               │  │
//! │        │                          │ item keys (one per item)        │  │
//! │        │                          └─────────────────────────────────┘  │
//! │        │ wrapped by secure key storage                                 │
//! │        ▼                                                                │
//! │  BiometricCryptoMaterial { iv, encKey }                                │
//! │                                                                         │
//! │  Bubbles key ──► contact local keys ──► contact shared keys,           │
//! │                                         conversations, message keys    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | ChaCha20-Poly1305 | All data and key envelopes |
//! | PBKDF2-HMAC-SHA256 | Password to master key |
//! | SHA-256 | Auto-destruction comparison key |
//! | HKDF-SHA256 | Contact id keys |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: `SymmetricKey`, `Password` and decrypted buffers
//!    are zeroized when dropped
//! 2. **Secure Random**: `rand::rngs::OsRng` for keys, salts and nonces
//! 3. **No Nonce Reuse**: every encryption draws a fresh 96-bit nonce

mod aead;
mod kdf;
mod keys;
mod slot;
mod stream;

pub use aead::{
    engine_for, AeadBackend, AeadEngine, RingEngine, RustCryptoEngine, NONCE_SIZE, OVERHEAD,
    TAG_SIZE,
};
pub use kdf::{
    derive_auto_destruction_key, derive_master_key, derive_master_key_blocking, derive_uuid_key,
    generate_salt, KdfConfig, MIN_SALT_LEN,
};
pub use keys::{Password, SymmetricKey, KEY_SIZE};
pub use slot::KeySlot;
pub use stream::{decrypt_stream, encrypt_stream, DecryptReader, EncryptWriter};
