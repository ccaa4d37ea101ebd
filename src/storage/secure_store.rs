//! # Secure Key Storage
//!
//! Capability interface over the platform keystore, plus a software
//! implementation and a small wrapped-value datastore built on top of it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SECURE KEY STORAGE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SecureKeyStorage Trait                                         │   │
//! │  │  ──────────────────────                                          │   │
//! │  │                                                                 │   │
//! │  │  • generate_key(alias, access) - Create a non-exportable key   │   │
//! │  │  • has_key(alias)              - Probe without a user prompt   │   │
//! │  │  • wrap_key(alias, iv, data)   - Encrypt under the held key    │   │
//! │  │  • unwrap_key(alias, iv, data) - Release gated by the platform │   │
//! │  │  • delete_key(alias)           - Forget the held key           │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌───────────────────┐            ┌──────────────────────────────┐     │
//! │  │ SoftwareKeyStorage│            │ SecureDataStore              │     │
//! │  │                   │            │                              │     │
//! │  │ AES-256-GCM,      │            │ name -> iv || wrapped value  │     │
//! │  │ 16-byte IV,       │            │ in the secure_datastore      │     │
//! │  │ simulated denial  │            │ table, one shared alias      │     │
//! │  └───────────────────┘            └──────────────────────────────┘     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Platform-bound keys do not manage nonces, so callers pass a fresh
//! 16-byte IV and persist it next to the wrapped bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;
use zeroize::Zeroizing;

use super::Database;
use crate::error::{Error, Result};
use crate::safe::SafeId;

/// Length of the IV handed to [`SecureKeyStorage::wrap_key`]
pub const WRAP_IV_SIZE: usize = 16;

/// Key aliases used in secure key storage
pub mod aliases {
    use crate::safe::SafeId;

    /// Key protecting the shared secure datastore
    pub const DATASTORE: &str = "safe.datastore";

    /// Biometric-gated key wrapping the master key of one safe
    pub fn biometric(safe_id: SafeId) -> String {
        format!("safe.biometric.{}", safe_id)
    }
}

/// When the platform may release a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAccess {
    /// Usable whenever the device is unlocked
    Always,
    /// Usable after a biometric check; invalidated by enrollment changes
    BiometryCurrentSet,
}

/// Failure reported by a secure key storage implementation
#[derive(Debug, thiserror::Error)]
pub enum KeyStorageError {
    /// The platform declined to release the key (cancelled, not recognized)
    #[error("key storage unavailable: {0}")]
    Unavailable(String),

    /// The key was never created or has been invalidated by the platform
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Any other platform failure
    #[error("key storage failure: {0}")]
    Failure(String),
}

impl From<KeyStorageError> for Error {
    fn from(err: KeyStorageError) -> Self {
        match err {
            KeyStorageError::Unavailable(_) | KeyStorageError::KeyNotFound(_) => {
                Error::BiometricUnavailable(err.to_string())
            }
            KeyStorageError::Failure(msg) => Error::Internal(format!("Key storage: {}", msg)),
        }
    }
}

/// Platform keystore capability
///
/// Implementations hold keys that never leave the storage; only wrap and
/// unwrap results cross the boundary.
#[async_trait]
pub trait SecureKeyStorage: Send + Sync {
    /// Create a key under `alias`, replacing any previous one
    async fn generate_key(&self, alias: &str, access: KeyAccess) -> std::result::Result<(), KeyStorageError>;

    /// Check whether `alias` currently holds a usable key
    async fn has_key(&self, alias: &str) -> std::result::Result<bool, KeyStorageError>;

    /// Encrypt `data` under the key held at `alias`
    async fn wrap_key(
        &self,
        alias: &str,
        iv: &[u8; WRAP_IV_SIZE],
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, KeyStorageError>;

    /// Decrypt `wrapped` under the key held at `alias`
    async fn unwrap_key(
        &self,
        alias: &str,
        iv: &[u8; WRAP_IV_SIZE],
        wrapped: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, KeyStorageError>;

    /// Remove the key held at `alias`, if any
    async fn delete_key(&self, alias: &str) -> std::result::Result<(), KeyStorageError>;
}

/// Draw a fresh wrap IV
pub fn generate_wrap_iv() -> [u8; WRAP_IV_SIZE] {
    let mut iv = [0u8; WRAP_IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

// ============================================================================
// SOFTWARE KEY STORAGE
// ============================================================================

type WrapCipher = AesGcm<Aes256, U16>;

struct StoredKey {
    key: Zeroizing<[u8; 32]>,
    access: KeyAccess,
}

/// In-process key storage
///
/// Keys live in memory. `set_available(false)` simulates the user
/// cancelling the biometric prompt and `invalidate` simulates an OS-level
/// biometric enrollment change.
pub struct SoftwareKeyStorage {
    keys: RwLock<HashMap<String, StoredKey>>,
    biometry_available: AtomicBool,
}

impl SoftwareKeyStorage {
    /// Create an empty storage with biometry available
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            biometry_available: AtomicBool::new(true),
        }
    }

    /// Toggle whether biometric-gated keys are released
    pub fn set_available(&self, available: bool) {
        self.biometry_available.store(available, Ordering::SeqCst);
    }

    /// Drop every biometric-gated key, as an enrollment change would
    pub fn invalidate_biometric_keys(&self) {
        self.keys
            .write()
            .retain(|_, stored| stored.access != KeyAccess::BiometryCurrentSet);
    }

    fn cipher_for(&self, alias: &str) -> std::result::Result<WrapCipher, KeyStorageError> {
        let keys = self.keys.read();
        let stored = keys
            .get(alias)
            .ok_or_else(|| KeyStorageError::KeyNotFound(alias.to_string()))?;

        if stored.access == KeyAccess::BiometryCurrentSet
            && !self.biometry_available.load(Ordering::SeqCst)
        {
            return Err(KeyStorageError::Unavailable(format!(
                "biometric check declined for {}",
                alias
            )));
        }

        WrapCipher::new_from_slice(stored.key.as_slice())
            .map_err(|e| KeyStorageError::Failure(format!("invalid stored key: {}", e)))
    }
}

impl Default for SoftwareKeyStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureKeyStorage for SoftwareKeyStorage {
    async fn generate_key(&self, alias: &str, access: KeyAccess) -> std::result::Result<(), KeyStorageError> {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(key.as_mut_slice());
        self.keys
            .write()
            .insert(alias.to_string(), StoredKey { key, access });
        Ok(())
    }

    async fn has_key(&self, alias: &str) -> std::result::Result<bool, KeyStorageError> {
        Ok(self.keys.read().contains_key(alias))
    }

    async fn wrap_key(
        &self,
        alias: &str,
        iv: &[u8; WRAP_IV_SIZE],
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, KeyStorageError> {
        let cipher = self.cipher_for(alias)?;
        cipher
            .encrypt(GenericArray::from_slice(iv), data)
            .map_err(|_| KeyStorageError::Failure(format!("wrap failed for {}", alias)))
    }

    async fn unwrap_key(
        &self,
        alias: &str,
        iv: &[u8; WRAP_IV_SIZE],
        wrapped: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, KeyStorageError> {
        let cipher = self.cipher_for(alias)?;
        cipher
            .decrypt(GenericArray::from_slice(iv), wrapped)
            .map(Zeroizing::new)
            .map_err(|_| KeyStorageError::Failure(format!("wrapped data rejected for {}", alias)))
    }

    async fn delete_key(&self, alias: &str) -> std::result::Result<(), KeyStorageError> {
        self.keys.write().remove(alias);
        Ok(())
    }
}

// ============================================================================
// SECURE DATASTORE
// ============================================================================

/// Named values wrapped by secure key storage and persisted in SQLite
pub struct SecureDataStore {
    database: Arc<Database>,
    key_storage: Arc<dyn SecureKeyStorage>,
    key_ready: tokio::sync::Mutex<bool>,
}

impl SecureDataStore {
    /// Create a datastore over `database`
    pub fn new(database: Arc<Database>, key_storage: Arc<dyn SecureKeyStorage>) -> Self {
        Self {
            database,
            key_storage,
            key_ready: tokio::sync::Mutex::new(false),
        }
    }

    async fn ensure_key(&self) -> Result<()> {
        let mut ready = self.key_ready.lock().await;
        if *ready {
            return Ok(());
        }
        if !self.key_storage.has_key(aliases::DATASTORE).await? {
            self.key_storage
                .generate_key(aliases::DATASTORE, KeyAccess::Always)
                .await?;
            tracing::debug!("Secure datastore key created");
        }
        *ready = true;
        Ok(())
    }

    /// Store `value` under `name`, optionally owned by a safe
    pub async fn put(&self, name: &str, safe_id: Option<SafeId>, value: &[u8]) -> Result<()> {
        self.ensure_key().await?;
        let iv = generate_wrap_iv();
        let wrapped = self
            .key_storage
            .wrap_key(aliases::DATASTORE, &iv, value)
            .await?;

        let mut row = Vec::with_capacity(WRAP_IV_SIZE + wrapped.len());
        row.extend_from_slice(&iv);
        row.extend_from_slice(&wrapped);
        self.database.datastore_put(name, safe_id, &row)
    }

    /// Read the value stored under `name`
    pub async fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let row = match self.database.datastore_get(name)? {
            Some(row) => row,
            None => return Ok(None),
        };
        if row.len() <= WRAP_IV_SIZE {
            return Err(Error::CorruptedVault(format!(
                "datastore value {} is {} bytes",
                name,
                row.len()
            )));
        }

        let (iv, wrapped) = row.split_at(WRAP_IV_SIZE);
        let mut iv_bytes = [0u8; WRAP_IV_SIZE];
        iv_bytes.copy_from_slice(iv);

        let value = self
            .key_storage
            .unwrap_key(aliases::DATASTORE, &iv_bytes, wrapped)
            .await?;
        Ok(Some(value))
    }

    /// Delete the value stored under `name`
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.database.datastore_delete(name)
    }
}

// ============================================================================
// TESTS
// ============================================================================
