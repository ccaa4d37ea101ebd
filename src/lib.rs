//! # Safe Core
//!
//! Key management for a local, multi-safe secrets manager. Every safe is
//! an independent key hierarchy rooted in a password.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SAFE CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │    Safe     │  │  Biometric  │  │    Trap     │  │   Bubbles    │   │
//! │  │             │  │             │  │             │  │  Messaging   │   │
//! │  │ - Onboard   │  │ - Enroll    │  │ - Decoy     │  │ - Contacts   │   │
//! │  │ - Unlock    │  │ - Unwrap    │  │ - Destroy   │  │ - Queue key  │   │
//! │  │ - Rotate    │  │ - Rewrap    │  │             │  │ - Msg keys   │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴────────────────┴────────────────┘           │
//! │                                   │                                     │
//! │  ┌─────────────────────────────┐  │  ┌────────────────────────────────┐│
//! │  │           Crypto            │  │  │           Storage              ││
//! │  │                             │  │  │                                ││
//! │  │ - ChaCha20-Poly1305 (2x)    │◄─┴─►│ - SQLite key bundles          ││
//! │  │ - PBKDF2 / HKDF / SHA-256   │     │ - Secure key storage seam     ││
//! │  │ - Key slots, streams        │     │ - Wrapped datastore           ││
//! │  └─────────────────────────────┘     └────────────────────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types and kinds
//! - [`crypto`] - AEAD engines, key derivation, key slots, streams
//! - [`storage`] - SQLite persistence and secure key storage
//! - [`safe`] - Safe lifecycle: onboarding, unlock, rotation, biometric, trap
//! - [`bubbles`] - Contact keys and the queue key
//! - [`messaging`] - Ratchet message keys
//!
//! ## Key Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY HIERARCHY                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password + salt ──PBKDF2──► master key                                │
//! │                                  │                                      │
//! │          ┌───────────┬───────────┼───────────┬──────────────┐          │
//! │          ▼           ▼           ▼           ▼              ▼          │
//! │      encTest     index key   bubbles key  edition key   item keys      │
//! │     (marker)         │           │                                      │
//! │                  words,      contact local keys                         │
//! │                  searches                                               │
//! │                                                                         │
//! │  Changing the password re-wraps the top layer only.                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod bubbles;
pub mod crypto;
pub mod error;
pub mod messaging;
pub mod safe;
pub mod storage;
/// Time helpers for record timestamps.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use crypto::{AeadBackend, KdfConfig, Password, SymmetricKey};
pub use error::{Error, ErrorKind, Result};
pub use safe::{OnboardingOutcome, RotationOutcome, SafeCrypto, SafeId};

// ============================================================================
// CONFIGURATION
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bubbles::BubblesCryptoRepository;
use messaging::{MessagingCryptoRepository, RatchetSessionProvider};
use safe::{AutoDestructionTrap, BiometricEscrow, EditCryptoRepository, MainCryptoRepository, SafeLocks};
use storage::{Database, SecureDataStore, SecureKeyStorage, StorageConfig};

/// Configuration for opening a [`SafeCore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Database file path (in-memory if None)
    pub database_path: Option<String>,
    /// Password KDF settings
    pub kdf: KdfConfig,
    /// AEAD implementation
    pub aead_backend: AeadBackend,
    /// Lifetime of decrypted index words, in seconds
    pub index_cache_ttl_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            kdf: KdfConfig::default(),
            aead_backend: AeadBackend::default(),
            index_cache_ttl_secs: 60,
        }
    }
}

impl CoreConfig {
    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        self.kdf.validate()?;
        if self.index_cache_ttl_secs == 0 {
            return Err(Error::InvalidConfig("index_cache_ttl_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Index cache lifetime as a [`Duration`]
    pub fn index_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.index_cache_ttl_secs)
    }
}

// ============================================================================
// CORE INSTANCE
// ============================================================================

/// All repositories wired over one database
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                        SAFE CORE LIFECYCLE                              │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. Open                                                                │
/// │     ┌─────────────┐                                                    │
/// │     │ SafeCore::  │──► Validate config                                 │
/// │     │ open()      │──► Open database, apply schema                     │
/// │     └─────────────┘──► Build engine and repositories                   │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  2. Onboard or Unlock                                                  │
/// │     ┌─────────────┐                                                    │
/// │     │ unlock()    │──► Trap check (may destroy a safe)                 │
/// │     │             │──► Match password against every safe               │
/// │     └─────────────┘──► Load master + index keys                        │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  3. Work                                                               │
/// │     items, search, contacts, rotation, biometric, trap setup           │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  4. lock()  ──► zeroize every slot, drop the index cache               │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct SafeCore {
    config: CoreConfig,
    database: Arc<Database>,
    main: Arc<MainCryptoRepository>,
    edit: Arc<EditCryptoRepository>,
    biometric: Arc<BiometricEscrow>,
    trap: AutoDestructionTrap,
    bubbles: Arc<BubblesCryptoRepository>,
}

impl SafeCore {
    /// Open the core over `key_storage`
    ///
    /// ## Example
    ///
    /// ```ignore
    /// use std::sync::Arc;
    /// use safe_core::{CoreConfig, SafeCore};
    /// use safe_core::storage::SoftwareKeyStorage;
    ///
    /// let core = SafeCore::open(CoreConfig::default(), Arc::new(SoftwareKeyStorage::new())).await?;
    /// ```
    pub async fn open(config: CoreConfig, key_storage: Arc<dyn SecureKeyStorage>) -> Result<Self> {
        tracing::info!("Opening Safe Core v{}", version());
        config.validate()?;

        let database = Arc::new(
            storage::init(StorageConfig {
                database_path: config.database_path.clone(),
            })
            .await?,
        );
        let main = Arc::new(MainCryptoRepository::new(
            database.clone(),
            crypto::engine_for(config.aead_backend),
            config.kdf,
            Arc::new(SafeLocks::new()),
            config.index_cache_ttl(),
        ));
        let biometric = Arc::new(BiometricEscrow::new(main.clone(), key_storage.clone()));
        let edit = Arc::new(EditCryptoRepository::new(main.clone(), biometric.clone()));
        let trap = AutoDestructionTrap::new(main.clone(), edit.clone());
        let datastore = Arc::new(SecureDataStore::new(database.clone(), key_storage));
        let bubbles = Arc::new(BubblesCryptoRepository::new(main.clone(), datastore));

        tracing::info!("Safe Core opened with {:?} backend", config.aead_backend);
        Ok(Self {
            config,
            database,
            main,
            edit,
            biometric,
            trap,
            bubbles,
        })
    }

    /// Unlock whichever safe `password` belongs to
    ///
    /// A destruction password deletes its safe and is then reported as
    /// [`Error::WrongPassword`], indistinguishable from a typo.
    pub async fn unlock(&self, password: Password) -> Result<SafeId> {
        let password = Arc::new(password);
        let destroyed = self.trap.check_and_execute_auto_destruction(&password).await?;
        if !destroyed.is_empty() {
            return Err(Error::WrongPassword);
        }
        self.main.unlock(password).await
    }

    /// Create a new safe protected by `password`
    pub async fn create_safe(&self, password: Password) -> Result<OnboardingOutcome> {
        self.edit.generate_cryptographic_data(Arc::new(password)).await
    }

    /// Unload every key
    pub fn lock(&self) {
        self.main.lock();
    }

    /// Ids of every safe on the device
    pub fn safe_ids(&self) -> Result<Vec<SafeId>> {
        Ok(self
            .database
            .get_all_safe_crypto()?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    /// Active configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Session keys, item and index crypto
    pub fn main(&self) -> &Arc<MainCryptoRepository> {
        &self.main
    }

    /// Onboarding, password change and safe deletion
    pub fn edit(&self) -> &Arc<EditCryptoRepository> {
        &self.edit
    }

    /// Biometric unlock
    pub fn biometric(&self) -> &Arc<BiometricEscrow> {
        &self.biometric
    }

    /// Destruction password
    pub fn auto_destruction(&self) -> &AutoDestructionTrap {
        &self.trap
    }

    /// Contact keys and the queue key
    pub fn bubbles(&self) -> &Arc<BubblesCryptoRepository> {
        &self.bubbles
    }

    /// Message crypto over a host-provided ratchet
    pub fn messaging(&self, sessions: Arc<dyn RatchetSessionProvider>) -> MessagingCryptoRepository {
        MessagingCryptoRepository::new(self.bubbles.clone(), self.main.engine().clone(), sessions)
    }
}

impl std::fmt::Debug for SafeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeCore")
            .field("config", &self.config)
            .field("current_safe", &self.main.current_safe())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Safe Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SoftwareKeyStorage;

    fn test_config() -> CoreConfig {
        CoreConfig {
            kdf: KdfConfig {
                iterations: 1_000,
                salt_len: 16,
            },
            ..CoreConfig::default()
        }
    }

    async fn open_core() -> SafeCore {
        SafeCore::open(test_config(), Arc::new(SoftwareKeyStorage::new()))
            .await
            .unwrap()
    }

    async fn create(core: &SafeCore, pw: &str) -> SafeId {
        match core.create_safe(Password::from(pw)).await.unwrap() {
            OnboardingOutcome::Created(record) => record.id,
            OnboardingOutcome::PasswordAlreadyUsed => panic!("password {pw:?} already used"),
        }
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_config_defaults_and_json() {
        let config = CoreConfig::default();
        assert_eq!(config.kdf.iterations, 120_000);
        assert_eq!(config.aead_backend, AeadBackend::RustCrypto);
        assert_eq!(config.index_cache_ttl(), Duration::from_secs(60));

        let parsed = CoreConfig::from_json(r#"{"aead_backend": "ring", "kdf": {"iterations": 5000}}"#).unwrap();
        assert_eq!(parsed.aead_backend, AeadBackend::Ring);
        assert_eq!(parsed.kdf.iterations, 5_000);
        assert_eq!(parsed.kdf.salt_len, 32);
        assert!(parsed.database_path.is_none());

        let err = CoreConfig::from_json(r#"{"kdf": {"iterations": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(CoreConfig::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_unlock_finds_the_right_safe() {
        let core = open_core().await;
        let first = create(&core, "first").await;
        let second = create(&core, "second").await;
        assert_eq!(core.safe_ids().unwrap().len(), 2);

        assert_eq!(core.unlock(Password::from("second")).await.unwrap(), second);
        core.lock();
        assert_eq!(core.unlock(Password::from("first")).await.unwrap(), first);

        core.lock();
        let err = core.unlock(Password::from("third")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongPassword);
    }

    #[tokio::test]
    async fn test_decoy_login_reports_wrong_password() {
        let core = open_core().await;
        let keep = create(&core, "keep").await;
        let doomed = create(&core, "real").await;

        core.unlock(Password::from("real")).await.unwrap();
        core.auto_destruction()
            .enable_auto_destruction(doomed, Arc::new(Password::from("decoy")))
            .await
            .unwrap();
        core.lock();

        let err = core.unlock(Password::from("decoy")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongPassword);
        assert_eq!(core.safe_ids().unwrap(), vec![keep]);

        let err = core.unlock(Password::from("real")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongPassword);
    }

    #[tokio::test]
    async fn test_ring_backend_end_to_end() {
        let config = CoreConfig {
            aead_backend: AeadBackend::Ring,
            ..test_config()
        };
        let core = SafeCore::open(config, Arc::new(SoftwareKeyStorage::new()))
            .await
            .unwrap();
        create(&core, "alpha").await;
        core.unlock(Password::from("alpha")).await.unwrap();

        let item = core.main().generate_item_key("note").await.unwrap();
        core.main().save_item_data(&item, b"secret note").await.unwrap();
        let loaded = core.main().load_item_data(&item).await.unwrap().unwrap();
        assert_eq!(loaded.as_slice(), b"secret note");
    }

    #[tokio::test]
    async fn test_file_backed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safes.db").to_string_lossy().into_owned();
        let config = CoreConfig {
            database_path: Some(path),
            ..test_config()
        };

        let id = {
            let core = SafeCore::open(config.clone(), Arc::new(SoftwareKeyStorage::new()))
                .await
                .unwrap();
            create(&core, "alpha").await
        };

        let core = SafeCore::open(config, Arc::new(SoftwareKeyStorage::new()))
            .await
            .unwrap();
        assert_eq!(core.unlock(Password::from("alpha")).await.unwrap(), id);
    }
}
