//! # Safe Module
//!
//! Per-safe key bundle and the repositories that operate on it.
//!
//! ## Components
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SAFE COMPONENTS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  MainCryptoRepository     unlock, session key slots, data crypto       │
//! │  EditCryptoRepository     onboarding, uniqueness, password change      │
//! │  BiometricEscrow          master key wrap/unwrap via key storage       │
//! │  AutoDestructionTrap      duress password detection and wipe           │
//! │  IndexCache               decrypted index words with idle expiry       │
//! │  SafeLocks                per-safe rotation/destruction serialization  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## SafeCrypto Layout
//!
//! | Field | Content |
//! |-------|---------|
//! | `salt` | random, at least 16 bytes |
//! | `enc_test` | [`MASTER_KEY_TEST_VALUE`] under the master key |
//! | `enc_index_key` | index key under the master key |
//! | `enc_bubbles_key` | bubbles key under the master key |
//! | `enc_item_edition_key` | item-edition key under the master key |
//! | `biometric_crypto_material` | present iff biometric unlock is enabled |
//! | `auto_destruction_key` | present iff the duress password is set |

mod auto_destruction;
mod biometric;
mod edit_crypto;
mod index_cache;
mod locks;
mod main_crypto;

pub use auto_destruction::AutoDestructionTrap;
pub use biometric::{BiometricEscrow, BIOMETRIC_ENC_KEY_SIZE, BIOMETRIC_IV_SIZE};
pub use edit_crypto::{EditCryptoRepository, OnboardingOutcome, RotationOutcome};
pub use index_cache::{IndexCache, IndexWordEntry, PlainIndexWord};
pub use locks::SafeLocks;
pub use main_crypto::{CryptoPurpose, MainCryptoRepository};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{AeadEngine, SymmetricKey, KEY_SIZE, MIN_SALT_LEN, OVERHEAD};
use crate::error::{Error, Result};

/// Plaintext encrypted under the master key as the password proof
pub const MASTER_KEY_TEST_VALUE: &str = "44c5dac9-17ba-4690-9275-c7471b2e0582";

/// Length of a working key or item key once encrypted
pub const ENC_KEY_SIZE: usize = KEY_SIZE + OVERHEAD;

/// Opaque identifier of one safe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SafeId(Uuid);

impl SafeId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SafeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SafeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SafeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::CorruptedVault(format!("Invalid safe id '{}': {}", s, e)))
    }
}

/// Master key wrapped by secure key storage
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiometricCryptoMaterial {
    /// IV used by the storage-held key
    pub iv: Vec<u8>,
    /// Wrapped master key (key + tag)
    pub enc_key: Vec<u8>,
}

impl fmt::Debug for BiometricCryptoMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiometricCryptoMaterial")
            .field("iv_len", &self.iv.len())
            .field("enc_key_len", &self.enc_key.len())
            .finish()
    }
}

impl BiometricCryptoMaterial {
    /// Check the envelope layout
    pub fn validate(&self) -> Result<()> {
        if self.iv.len() != BIOMETRIC_IV_SIZE || self.enc_key.len() != BIOMETRIC_ENC_KEY_SIZE {
            return Err(Error::CorruptedVault(format!(
                "biometric material has iv {} / key {} bytes, expected {} / {}",
                self.iv.len(),
                self.enc_key.len(),
                BIOMETRIC_IV_SIZE,
                BIOMETRIC_ENC_KEY_SIZE
            )));
        }
        Ok(())
    }
}

/// Persisted key bundle of one safe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeCrypto {
    /// Safe identifier
    pub id: SafeId,
    /// KDF salt
    pub salt: Vec<u8>,
    /// Test marker under the master key
    pub enc_test: Vec<u8>,
    /// Index key under the master key
    pub enc_index_key: Vec<u8>,
    /// Bubbles key under the master key
    pub enc_bubbles_key: Vec<u8>,
    /// Item-edition key under the master key
    pub enc_item_edition_key: Vec<u8>,
    /// Biometric envelope, if enabled
    pub biometric_crypto_material: Option<BiometricCryptoMaterial>,
    /// Auto-destruction comparison key, if enabled
    pub auto_destruction_key: Option<Vec<u8>>,
}

impl SafeCrypto {
    /// Check field lengths
    ///
    /// Catches truncated or mis-assigned columns before any decryption is
    /// attempted, so they surface as [`Error::CorruptedVault`] rather than
    /// as a wrong password.
    pub fn validate(&self) -> Result<()> {
        if self.salt.len() < MIN_SALT_LEN {
            return Err(Error::CorruptedVault(format!(
                "salt of safe {} is {} bytes",
                self.id,
                self.salt.len()
            )));
        }
        if self.enc_test.len() != MASTER_KEY_TEST_VALUE.len() + OVERHEAD {
            return Err(Error::CorruptedVault(format!(
                "test marker of safe {} is {} bytes",
                self.id,
                self.enc_test.len()
            )));
        }
        for (name, field) in [
            ("index key", &self.enc_index_key),
            ("bubbles key", &self.enc_bubbles_key),
            ("item-edition key", &self.enc_item_edition_key),
        ] {
            if field.len() != ENC_KEY_SIZE {
                return Err(Error::CorruptedVault(format!(
                    "encrypted {} of safe {} is {} bytes",
                    name,
                    self.id,
                    field.len()
                )));
            }
        }
        if let Some(material) = &self.biometric_crypto_material {
            material.validate()?;
        }
        Ok(())
    }

    /// Salt as the string used for the auto-destruction hash
    pub fn salt_string(&self) -> String {
        hex::encode(&self.salt)
    }
}

/// Per-item key, stored encrypted under the master key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    /// Item identifier
    pub id: String,
    /// Owning safe
    pub safe_id: SafeId,
    /// Key under the master key
    pub enc_value: Vec<u8>,
}

/// The three purpose-scoped working keys of a safe
pub(crate) struct WorkingKeys {
    pub index: SymmetricKey,
    pub bubbles: SymmetricKey,
    pub item_edition: SymmetricKey,
}

impl WorkingKeys {
    pub fn generate() -> Self {
        Self {
            index: SymmetricKey::generate(),
            bubbles: SymmetricKey::generate(),
            item_edition: SymmetricKey::generate(),
        }
    }

    /// Decrypt the working keys of `record` with its master key
    pub fn open(engine: &dyn AeadEngine, record: &SafeCrypto, master: &SymmetricKey) -> Result<Self> {
        Ok(Self {
            index: open_key(engine, &record.enc_index_key, master, "index key")?,
            bubbles: open_key(engine, &record.enc_bubbles_key, master, "bubbles key")?,
            item_edition: open_key(engine, &record.enc_item_edition_key, master, "item-edition key")?,
        })
    }
}

/// Decrypt a key envelope
pub(crate) fn open_key(
    engine: &dyn AeadEngine,
    enc: &[u8],
    wrapping: &SymmetricKey,
    what: &str,
) -> Result<SymmetricKey> {
    let raw = engine
        .decrypt(enc, wrapping.as_bytes(), None)
        .map_err(|e| e.with_context(what))?;
    SymmetricKey::from_slice(&raw)
        .map_err(|_| Error::CorruptedVault(format!("decrypted {} has {} bytes", what, raw.len())))
}

/// Encrypt a key envelope
pub(crate) fn seal_key(
    engine: &dyn AeadEngine,
    key: &SymmetricKey,
    wrapping: &SymmetricKey,
) -> Result<Vec<u8>> {
    engine.encrypt(key.as_bytes(), wrapping.as_bytes(), None)
}

/// Build a fresh bundle for `master`
pub(crate) fn build_safe_crypto(
    engine: &dyn AeadEngine,
    id: SafeId,
    salt: Vec<u8>,
    master: &SymmetricKey,
    working: &WorkingKeys,
) -> Result<SafeCrypto> {
    Ok(SafeCrypto {
        id,
        salt,
        enc_test: engine.encrypt(MASTER_KEY_TEST_VALUE.as_bytes(), master.as_bytes(), None)?,
        enc_index_key: seal_key(engine, &working.index, master)?,
        enc_bubbles_key: seal_key(engine, &working.bubbles, master)?,
        enc_item_edition_key: seal_key(engine, &working.item_edition, master)?,
        biometric_crypto_material: None,
        auto_destruction_key: None,
    })
}

/// Check whether `master` opens the test marker of `record`
///
/// A tag mismatch means "not this password"; any other failure is
/// propagated.
pub(crate) fn verify_master_key(
    engine: &dyn AeadEngine,
    record: &SafeCrypto,
    master: &SymmetricKey,
) -> Result<bool> {
    match engine.decrypt(&record.enc_test, master.as_bytes(), None) {
        Ok(plain) => Ok(plain.as_slice() == MASTER_KEY_TEST_VALUE.as_bytes()),
        Err(Error::CryptoAuthFailure(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::crypto::{engine_for, AeadBackend, KdfConfig, Password};
    use crate::storage::{Database, SecureKeyStorage, SoftwareKeyStorage};

    pub fn fast_kdf() -> KdfConfig {
        KdfConfig {
            iterations: 1_000,
            salt_len: 16,
        }
    }

    pub fn password(value: &str) -> Arc<Password> {
        Arc::new(Password::from(value))
    }

    /// Repositories wired over an in-memory database
    pub struct TestEnv {
        pub database: Arc<Database>,
        pub key_storage: Arc<SoftwareKeyStorage>,
        pub main: Arc<MainCryptoRepository>,
        pub biometric: Arc<BiometricEscrow>,
        pub edit: Arc<EditCryptoRepository>,
        pub trap: AutoDestructionTrap,
    }

    impl TestEnv {
        pub async fn new() -> Self {
            let database = Arc::new(Database::open(None).await.unwrap());
            let key_storage = Arc::new(SoftwareKeyStorage::new());
            let main = Arc::new(MainCryptoRepository::new(
                database.clone(),
                engine_for(AeadBackend::RustCrypto),
                fast_kdf(),
                Arc::new(SafeLocks::new()),
                Duration::from_secs(60),
            ));
            let storage: Arc<dyn SecureKeyStorage> = key_storage.clone();
            let biometric = Arc::new(BiometricEscrow::new(main.clone(), storage));
            let edit = Arc::new(EditCryptoRepository::new(main.clone(), biometric.clone()));
            let trap = AutoDestructionTrap::new(main.clone(), edit.clone());
            Self {
                database,
                key_storage,
                main,
                biometric,
                edit,
                trap,
            }
        }
    }

    pub async fn create_safe(env: &TestEnv, pw: &str) -> SafeId {
        match env.edit.generate_cryptographic_data(password(pw)).await.unwrap() {
            OnboardingOutcome::Created(record) => record.id,
            OnboardingOutcome::PasswordAlreadyUsed => panic!("password {pw:?} already used"),
        }
    }
}
