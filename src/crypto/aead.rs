//! # AEAD Engine
//!
//! ChaCha20-Poly1305 authenticated encryption behind a backend-neutral
//! trait.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ENCRYPTED PAYLOAD                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┬──────────────────────────────┬──────────────────┐     │
//! │  │ Nonce        │ Ciphertext                   │ Poly1305 Tag     │     │
//! │  │ (12 bytes)   │ (same length as plaintext)   │ (16 bytes)       │     │
//! │  └──────────────┴──────────────────────────────┴──────────────────┘     │
//! │                                                                         │
//! │  Both backends emit and accept exactly this layout, so data written    │
//! │  by one build decrypts with the other.                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A fresh nonce is drawn from `OsRng` on every call. Engines hold no state
//! between calls.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::keys::KEY_SIZE;
use crate::error::{Error, Result};

/// Size of the nonce prefix in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Bytes added to every plaintext by encryption
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Which AEAD implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AeadBackend {
    /// Pure-Rust `chacha20poly1305` crate
    #[default]
    RustCrypto,
    /// `ring`, with platform-accelerated assembly
    Ring,
}

/// Authenticated encryption with associated data
///
/// `encrypt` returns `nonce || ciphertext || tag`; `decrypt` takes the same
/// layout. A tag mismatch, a wrong key or a truncated input always yields
/// [`Error::CryptoAuthFailure`].
pub trait AeadEngine: Send + Sync + fmt::Debug {
    /// Backend identifier
    fn backend(&self) -> AeadBackend;

    /// Encrypt `plain` under `key`
    fn encrypt(&self, plain: &[u8], key: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Decrypt and authenticate `cipher` under `key`
    fn decrypt(&self, cipher: &[u8], key: &[u8], aad: Option<&[u8]>)
        -> Result<Zeroizing<Vec<u8>>>;
}

/// Build the engine for a backend
pub fn engine_for(backend: AeadBackend) -> Arc<dyn AeadEngine> {
    match backend {
        AeadBackend::RustCrypto => Arc::new(RustCryptoEngine),
        AeadBackend::Ring => Arc::new(RingEngine),
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(Error::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Ok(())
}

pub(super) fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn split_payload(cipher: &[u8]) -> Result<(&[u8], &[u8])> {
    if cipher.len() < OVERHEAD {
        return Err(Error::CryptoAuthFailure(format!(
            "payload of {} bytes is shorter than nonce and tag",
            cipher.len()
        )));
    }
    Ok(cipher.split_at(NONCE_SIZE))
}

// ============================================================================
// RUSTCRYPTO BACKEND
// ============================================================================

/// ChaCha20-Poly1305 from the RustCrypto `chacha20poly1305` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoEngine;

impl AeadEngine for RustCryptoEngine {
    fn backend(&self) -> AeadBackend {
        AeadBackend::RustCrypto
    }

    fn encrypt(&self, plain: &[u8], key: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        check_key(key)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::InvalidKey(format!("Invalid ChaCha20 key: {}", e)))?;

        let nonce = random_nonce();
        let payload = Payload {
            msg: plain,
            aad: aad.unwrap_or_default(),
        };
        let sealed = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
            .map_err(|e| Error::EncryptionFailed(format!("ChaCha20-Poly1305 encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        cipher: &[u8],
        key: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        check_key(key)?;
        let (nonce, body) = split_payload(cipher)?;
        let aead = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::InvalidKey(format!("Invalid ChaCha20 key: {}", e)))?;

        let payload = Payload {
            msg: body,
            aad: aad.unwrap_or_default(),
        };
        aead.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            .map(Zeroizing::new)
            .map_err(|_| Error::CryptoAuthFailure("payload (tag mismatch)".into()))
    }
}

// ============================================================================
// RING BACKEND
// ============================================================================

/// ChaCha20-Poly1305 from `ring`
#[derive(Debug, Default, Clone, Copy)]
pub struct RingEngine;

impl RingEngine {
    fn sealing_key(key: &[u8]) -> Result<ring::aead::LessSafeKey> {
        check_key(key)?;
        let unbound = ring::aead::UnboundKey::new(&ring::aead::CHACHA20_POLY1305, key)
            .map_err(|_| Error::InvalidKey("ring rejected ChaCha20 key".into()))?;
        Ok(ring::aead::LessSafeKey::new(unbound))
    }
}

impl AeadEngine for RingEngine {
    fn backend(&self) -> AeadBackend {
        AeadBackend::Ring
    }

    fn encrypt(&self, plain: &[u8], key: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let key = Self::sealing_key(key)?;
        let nonce = random_nonce();

        let mut out = Vec::with_capacity(NONCE_SIZE + plain.len() + TAG_SIZE);
        out.extend_from_slice(&nonce);
        let mut in_out = plain.to_vec();
        key.seal_in_place_append_tag(
            ring::aead::Nonce::assume_unique_for_key(nonce),
            ring::aead::Aad::from(aad.unwrap_or_default()),
            &mut in_out,
        )
        .map_err(|_| Error::EncryptionFailed("ring ChaCha20-Poly1305 seal failed".into()))?;
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(
        &self,
        cipher: &[u8],
        key: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let key = Self::sealing_key(key)?;
        let (nonce, body) = split_payload(cipher)?;
        let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| Error::CryptoAuthFailure("payload (bad nonce)".into()))?;

        let mut in_out = Zeroizing::new(body.to_vec());
        let plain_len = key
            .open_in_place(nonce, ring::aead::Aad::from(aad.unwrap_or_default()), &mut in_out)
            .map_err(|_| Error::CryptoAuthFailure("payload (tag mismatch)".into()))?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }
}

// ============================================================================
// TESTS
// ============================================================================
