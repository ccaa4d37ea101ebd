//! # Key Derivation Functions
//!
//! Password-based and auxiliary key derivation.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    KEY DERIVATION PATHS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Master key (slow)                                                     │
//! │    PBKDF2-HMAC-SHA256(password, salt, iterations) → 32 bytes           │
//! │    iterations come from KdfConfig, run on the blocking pool            │
//! │                                                                         │
//! │  Auto-destruction trap key (fast)                                      │
//! │    hex(SHA-256(salt_string || password))                               │
//! │    comparison only, never used to decrypt                              │
//! │                                                                         │
//! │  Contact id key                                                        │
//! │    HKDF-SHA256(ikm = uuid bytes, info = domain::CONTACT_ID_KEY)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::num::NonZeroU32;
use std::sync::Arc;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use super::keys::{Password, SymmetricKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Domain separation strings for HKDF
pub mod domain {
    /// Key derived from a contact's UUID
    pub const CONTACT_ID_KEY: &[u8] = b"safe-core-contact-id-key-v1";
}

/// Smallest salt accepted for a new safe
pub const MIN_SALT_LEN: usize = 16;

/// Password KDF settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// Length of freshly generated salts
    pub salt_len: usize,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: 120_000,
            salt_len: 32,
        }
    }
}

impl KdfConfig {
    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::InvalidConfig("kdf.iterations must be at least 1".into()));
        }
        if self.salt_len < MIN_SALT_LEN {
            return Err(Error::InvalidConfig(format!(
                "kdf.salt_len must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }
        Ok(())
    }

    fn iterations(&self) -> Result<NonZeroU32> {
        NonZeroU32::new(self.iterations)
            .ok_or_else(|| Error::KeyDerivationFailed("iteration count is zero".into()))
    }
}

/// Generate a random salt of `len` bytes
pub fn generate_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a master key with PBKDF2-HMAC-SHA256
///
/// CPU-bound; async callers go through [`derive_master_key_blocking`].
pub fn derive_master_key(
    password: &Password,
    salt: &[u8],
    config: &KdfConfig,
) -> Result<SymmetricKey> {
    let mut out = [0u8; KEY_SIZE];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        config.iterations()?,
        salt,
        password.as_bytes(),
        &mut out,
    );
    let key = SymmetricKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// Derive a master key on the blocking thread pool
pub async fn derive_master_key_blocking(
    password: Arc<Password>,
    salt: Vec<u8>,
    config: KdfConfig,
) -> Result<SymmetricKey> {
    tokio::task::spawn_blocking(move || derive_master_key(&password, &salt, &config)).await?
}

/// Derive the auto-destruction comparison key
///
/// `hex(SHA-256(salt || password))`. Intentionally fast: the result is only
/// ever compared, never used as an encryption key.
pub fn derive_auto_destruction_key(password: &Password, salt: &str) -> Zeroizing<String> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    let encoded = Zeroizing::new(hex::encode(digest.as_slice()));
    digest.as_mut_slice().zeroize();
    encoded
}

/// Derive `len` bytes of key material from a contact UUID
pub fn derive_uuid_key(uuid: &Uuid, len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(None, uuid.as_bytes());
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(domain::CONTACT_ID_KEY, &mut okm)
        .map_err(|_| Error::KeyDerivationFailed(format!("HKDF cannot produce {} bytes", len)))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfConfig {
        KdfConfig {
            iterations: 1_000,
            salt_len: 16,
        }
    }

    #[test]
    fn test_master_key_deterministic() {
        let salt = generate_salt(16);
        let a = derive_master_key(&Password::from("correct-horse"), &salt, &fast()).unwrap();
        let b = derive_master_key(&Password::from("correct-horse"), &salt, &fast()).unwrap();
        assert!(a.ct_eq(&b));
    }

    #[test]
    fn test_master_key_depends_on_password_and_salt() {
        let salt = generate_salt(16);
        let base = derive_master_key(&Password::from("correct-horse"), &salt, &fast()).unwrap();
        let other_pw = derive_master_key(&Password::from("battery-staple"), &salt, &fast()).unwrap();
        let other_salt =
            derive_master_key(&Password::from("correct-horse"), &generate_salt(16), &fast()).unwrap();
        assert!(!base.ct_eq(&other_pw));
        assert!(!base.ct_eq(&other_salt));
    }

    #[test]
    fn test_master_key_depends_on_iterations() {
        let salt = generate_salt(16);
        let a = derive_master_key(&Password::from("pw"), &salt, &fast()).unwrap();
        let more = KdfConfig {
            iterations: 1_001,
            ..fast()
        };
        let b = derive_master_key(&Password::from("pw"), &salt, &more).unwrap();
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = KdfConfig {
            iterations: 0,
            salt_len: 16,
        };
        assert!(config.validate().is_err());
        assert!(derive_master_key(&Password::from("pw"), b"salt", &config).is_err());
    }

    #[test]
    fn test_short_salt_rejected() {
        let config = KdfConfig {
            iterations: 10,
            salt_len: 8,
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_blocking_derivation_matches_sync() {
        let salt = generate_salt(16);
        let password = Arc::new(Password::from("correct-horse"));
        let sync = derive_master_key(&password, &salt, &fast()).unwrap();
        let blocking = derive_master_key_blocking(password, salt, fast()).await.unwrap();
        assert!(sync.ct_eq(&blocking));
    }

    #[test]
    fn test_auto_destruction_key_is_salted_sha256() {
        let key = derive_auto_destruction_key(&Password::from("duress"), "abcd");
        let expected = hex::encode(Sha256::digest(b"abcdduress"));
        assert_eq!(key.as_str(), expected);
        assert_eq!(key.len(), 64);

        let other_salt = derive_auto_destruction_key(&Password::from("duress"), "abce");
        assert_ne!(key.as_str(), other_salt.as_str());
    }

    #[test]
    fn test_uuid_key() {
        let id = Uuid::new_v4();
        let a = derive_uuid_key(&id, 32).unwrap();
        let b = derive_uuid_key(&id, 32).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert_ne!(a.as_slice(), derive_uuid_key(&Uuid::new_v4(), 32).unwrap().as_slice());
        assert!(derive_uuid_key(&id, 255 * 32 + 1).is_err());
    }
}
