//! # Edit Crypto Repository
//!
//! Creates key bundles, enforces password uniqueness across safes, rotates
//! keys on password change and deletes safes.
//!
//! ## Password Change
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         KEY ROTATION                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  exclusive safe lock                                                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  1. new salt, new master key, new encTest          (memory only)       │
//! │  2. working keys re-encrypted under the new master (same keys)         │
//! │  3. biometric envelope rewrapped                   (key storage)       │
//! │  4. every item key: open(old) ──► seal(new)        (memory only)       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌───────────────────────────────────────────────┐                     │
//! │  │ 5. ONE transaction: item keys + SafeCrypto    │ fail ─► rollback,   │
//! │  └───────────────────────────────────────────────┘   KeyRotationAborted│
//! │        │ commit                                                         │
//! │        ▼                                                                │
//! │  6. swap the in-memory master key, old one zeroized                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing awaits between the start of step 5 and the end of step 6, so a
//! cancelled caller either sees the old state everywhere or the new one.
//! The auto-destruction key depends on the salt and is cleared by step 1;
//! the caller learns about it through [`RotationOutcome`].
//!
//! ## Password Registry
//!
//! Every path that checks a password against all safes and then writes a
//! new password (onboarding, rotation, trap setup) holds the registry
//! mutex across both steps. Lock order: safe lock, then registry.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::auto_destruction::matches_any_trap;
use super::biometric::BiometricEscrow;
use super::main_crypto::MainCryptoRepository;
use super::{build_safe_crypto, open_key, seal_key, ItemKey, SafeCrypto, SafeId, WorkingKeys};
use crate::crypto::{derive_master_key_blocking, generate_salt, Password, SymmetricKey};
use crate::error::{Error, Result};
use crate::storage::Database;

/// Result of creating a safe's key bundle
#[derive(Debug)]
pub enum OnboardingOutcome {
    /// Bundle created and persisted
    Created(SafeCrypto),
    /// The password already unlocks another safe; nothing was created
    PasswordAlreadyUsed,
}

/// Side effects of a committed password change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationOutcome {
    /// The auto-destruction password was removed and must be set again
    pub trap_cleared: bool,
    /// Biometric unlock could not be rewrapped and was turned off
    pub biometric_disabled: bool,
}

/// Onboarding, password change and safe deletion
pub struct EditCryptoRepository {
    main: Arc<MainCryptoRepository>,
    biometric: Arc<BiometricEscrow>,
    password_registry: Mutex<()>,
}

impl EditCryptoRepository {
    /// Create a repository over the session repository
    pub fn new(main: Arc<MainCryptoRepository>, biometric: Arc<BiometricEscrow>) -> Self {
        Self {
            main,
            biometric,
            password_registry: Mutex::new(()),
        }
    }

    /// Serialize a uniqueness check with the write that depends on it
    pub(crate) async fn password_registry(&self) -> MutexGuard<'_, ()> {
        self.password_registry.lock().await
    }

    // ========================================================================
    // ONBOARDING
    // ========================================================================

    /// Create and persist the key bundle of a new safe
    ///
    /// Does not unlock the new safe.
    pub async fn generate_cryptographic_data(
        &self,
        password: Arc<Password>,
    ) -> Result<OnboardingOutcome> {
        let _registry = self.password_registry().await;
        if !self.check_password_uniqueness(password.clone()).await? {
            return Ok(OnboardingOutcome::PasswordAlreadyUsed);
        }

        let kdf = self.main.kdf();
        let salt = generate_salt(kdf.salt_len);
        let master = derive_master_key_blocking(password, salt.clone(), kdf).await?;

        let record = build_safe_crypto(
            self.main.engine().as_ref(),
            SafeId::new(),
            salt,
            &master,
            &WorkingKeys::generate(),
        )?;
        self.database().insert_safe_crypto(&record)?;

        tracing::info!("Safe {} created", record.id);
        Ok(OnboardingOutcome::Created(record))
    }

    /// Whether `password` is free to use for a new safe
    ///
    /// Taken when it unlocks an existing safe or matches an auto-destruction
    /// password.
    pub async fn check_password_uniqueness(&self, password: Arc<Password>) -> Result<bool> {
        if matches_any_trap(self.database(), &password)? {
            return Ok(false);
        }
        Ok(self.main.find_safe_for_password(password).await?.is_none())
    }

    // ========================================================================
    // PASSWORD CHANGE
    // ========================================================================

    /// Rotate the keys of an unlocked safe to `new_password`
    ///
    /// Returns [`Error::PasswordAlreadyUsed`] when the new password belongs
    /// to another safe; any other failure before commit is reported as
    /// [`Error::KeyRotationAborted`] with storage untouched.
    pub async fn change_password(
        &self,
        safe_id: SafeId,
        new_password: Arc<Password>,
    ) -> Result<RotationOutcome> {
        let _guard = self.main.locks().write(safe_id).await;
        let _registry = self.password_registry().await;
        tracing::info!("Key rotation started for safe {}", safe_id);

        match self.rotate(safe_id, new_password).await {
            Ok(outcome) => Ok(outcome),
            Err(Error::PasswordAlreadyUsed) => Err(Error::PasswordAlreadyUsed),
            Err(e) => {
                tracing::warn!("Key rotation aborted for safe {}: {}", safe_id, e);
                Err(Error::rotation_aborted(e))
            }
        }
    }

    async fn rotate(&self, safe_id: SafeId, new_password: Arc<Password>) -> Result<RotationOutcome> {
        let engine = self.main.engine().clone();
        let old_master = self.main.with_master_key(safe_id, SymmetricKey::clone)?;
        let record = self.database().require_safe_crypto(safe_id)?;

        if matches_any_trap(self.database(), &new_password)? {
            return Err(Error::PasswordAlreadyUsed);
        }
        if let Some((owner, _)) = self.main.find_safe_for_password(new_password.clone()).await? {
            if owner != safe_id {
                return Err(Error::PasswordAlreadyUsed);
            }
        }

        let kdf = self.main.kdf();
        let salt = generate_salt(kdf.salt_len);
        let new_master = derive_master_key_blocking(new_password, salt.clone(), kdf).await?;

        let working = WorkingKeys::open(engine.as_ref(), &record, &old_master)?;
        let mut rotated = build_safe_crypto(engine.as_ref(), safe_id, salt, &new_master, &working)?;

        let mut outcome = RotationOutcome {
            trap_cleared: record.auto_destruction_key.is_some(),
            biometric_disabled: false,
        };
        if record.biometric_crypto_material.is_some() {
            match self.biometric.rewrap(safe_id, &new_master).await {
                Ok(material) => rotated.biometric_crypto_material = Some(material),
                Err(Error::BiometricUnavailable(reason)) => {
                    tracing::warn!(
                        "Biometric unlock disabled for safe {} during rotation: {}",
                        safe_id,
                        reason
                    );
                    outcome.biometric_disabled = true;
                }
                Err(e) => return Err(e),
            }
        }
        if outcome.trap_cleared {
            tracing::info!("Auto-destruction cleared for safe {} by password change", safe_id);
        }

        let item_keys = self.reencrypt_item_keys(safe_id, &old_master, &new_master)?;

        // No await from here until the swap.
        self.database().with_transaction(|tx| {
            Database::update_item_keys(tx, &item_keys)?;
            Database::write_safe_crypto(tx, &rotated)?;
            Ok(())
        })?;

        if let Err(e) = self.main.swap_master_key(safe_id, new_master) {
            // Committed already; the session was locked meanwhile and the
            // next unlock uses the new password.
            tracing::warn!("Rotated safe {} was no longer unlocked: {}", safe_id, e);
        }
        tracing::info!(
            "Key rotation committed for safe {} ({} item keys)",
            safe_id,
            item_keys.len()
        );

        if outcome.biometric_disabled {
            self.biometric.forget_key(safe_id).await;
        }
        Ok(outcome)
    }

    fn reencrypt_item_keys(
        &self,
        safe_id: SafeId,
        old_master: &SymmetricKey,
        new_master: &SymmetricKey,
    ) -> Result<Vec<ItemKey>> {
        let engine = self.main.engine();
        self.database()
            .get_all_item_keys(safe_id)?
            .into_iter()
            .map(|item_key| {
                let raw = open_key(engine.as_ref(), &item_key.enc_value, old_master, "item key")?;
                Ok(ItemKey {
                    enc_value: seal_key(engine.as_ref(), &raw, new_master)?,
                    ..item_key
                })
            })
            .collect()
    }

    // ========================================================================
    // DELETION
    // ========================================================================

    /// Delete a safe with everything stored for it
    ///
    /// Clears the session first when it belongs to this safe. Returns
    /// whether the safe existed.
    pub async fn delete_safe(&self, safe_id: SafeId) -> Result<bool> {
        let existed = {
            let _guard = self.main.locks().write(safe_id).await;
            self.main.forget_safe(safe_id);
            self.database().delete_safe(safe_id)?
        };

        self.biometric.forget_key(safe_id).await;
        self.main.locks().forget(safe_id);

        if existed {
            tracing::info!("Safe {} deleted", safe_id);
        }
        Ok(existed)
    }

    fn database(&self) -> &Arc<Database> {
        self.main.database()
    }
}

// ============================================================================
// TESTS
// ============================================================================
