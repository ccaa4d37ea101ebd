//! # Biometric Escrow
//!
//! Wraps the master key with a biometric-gated key held by secure key
//! storage, so the password step can be skipped.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      BIOMETRIC ENVELOPE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  enroll:   iv (16, random) ─┐                                          │
//! │            master key (32) ─┼─► key storage wrap ──► encKey (32 + 16)  │
//! │                             │   alias safe.biometric.<id>              │
//! │                                                                         │
//! │  unwrap:   (iv, encKey) ──► key storage unwrap ──► master key          │
//! │                               │                                         │
//! │                               └── denied / invalidated                 │
//! │                                   ──► BiometricUnavailable             │
//! │                                       (caller falls back to password)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use super::main_crypto::MainCryptoRepository;
use super::{BiometricCryptoMaterial, SafeId};
use crate::crypto::{SymmetricKey, KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::storage::{aliases, generate_wrap_iv, KeyAccess, SecureKeyStorage, WRAP_IV_SIZE};

/// Length of the IV stored in [`BiometricCryptoMaterial`]
pub const BIOMETRIC_IV_SIZE: usize = WRAP_IV_SIZE;

/// Length of the wrapped master key stored in [`BiometricCryptoMaterial`]
pub const BIOMETRIC_ENC_KEY_SIZE: usize = KEY_SIZE + TAG_SIZE;

/// Biometric wrap and unwrap of master keys
pub struct BiometricEscrow {
    main: Arc<MainCryptoRepository>,
    key_storage: Arc<dyn SecureKeyStorage>,
}

impl BiometricEscrow {
    /// Create an escrow backed by `key_storage`
    pub fn new(main: Arc<MainCryptoRepository>, key_storage: Arc<dyn SecureKeyStorage>) -> Self {
        Self { main, key_storage }
    }

    /// Create a fresh storage key for `safe_id` and wrap `master` with it
    pub async fn enroll_biometric(
        &self,
        safe_id: SafeId,
        master: &SymmetricKey,
    ) -> Result<BiometricCryptoMaterial> {
        self.key_storage
            .generate_key(&aliases::biometric(safe_id), KeyAccess::BiometryCurrentSet)
            .await?;
        self.rewrap(safe_id, master).await
    }

    /// Release the master key held in `material`
    pub async fn unwrap_biometric(
        &self,
        safe_id: SafeId,
        material: &BiometricCryptoMaterial,
    ) -> Result<SymmetricKey> {
        material.validate()?;
        let mut iv = [0u8; BIOMETRIC_IV_SIZE];
        iv.copy_from_slice(&material.iv);

        let raw = self
            .key_storage
            .unwrap_key(&aliases::biometric(safe_id), &iv, &material.enc_key)
            .await?;
        SymmetricKey::from_slice(&raw)
            .map_err(|_| Error::CorruptedVault(format!("biometric key of safe {} has bad length", safe_id)))
    }

    /// Enable biometric unlock for the unlocked safe
    pub async fn enable_biometric(&self, safe_id: SafeId) -> Result<()> {
        let _guard = self.main.locks().write(safe_id).await;
        let master = self.main.with_master_key(safe_id, SymmetricKey::clone)?;

        let material = self.enroll_biometric(safe_id, &master).await?;
        self.main
            .database()
            .set_biometric_material(safe_id, Some(&material))?;

        tracing::info!("Biometric unlock enabled for safe {}", safe_id);
        Ok(())
    }

    /// Disable biometric unlock and forget the storage key
    pub async fn disable_biometric(&self, safe_id: SafeId) -> Result<()> {
        {
            let _guard = self.main.locks().write(safe_id).await;
            self.main.database().set_biometric_material(safe_id, None)?;
        }
        self.forget_key(safe_id).await;

        tracing::info!("Biometric unlock disabled for safe {}", safe_id);
        Ok(())
    }

    /// Whether the safe has a biometric envelope
    pub fn is_biometric_enabled(&self, safe_id: SafeId) -> Result<bool> {
        Ok(self
            .main
            .database()
            .require_safe_crypto(safe_id)?
            .biometric_crypto_material
            .is_some())
    }

    /// Unlock `safe_id` through secure key storage
    pub async fn unlock_via_biometric(&self, safe_id: SafeId) -> Result<()> {
        let record = self.main.database().require_safe_crypto(safe_id)?;
        let material = record
            .biometric_crypto_material
            .ok_or(Error::BiometricNotEnabled(safe_id))?;

        let master = self.unwrap_biometric(safe_id, &material).await?;
        self.main.load_master_key_external(safe_id, master)?;

        tracing::info!("Safe {} unlocked with biometrics", safe_id);
        Ok(())
    }

    /// Wrap `master` under the existing storage key of `safe_id`
    pub(crate) async fn rewrap(
        &self,
        safe_id: SafeId,
        master: &SymmetricKey,
    ) -> Result<BiometricCryptoMaterial> {
        let iv = generate_wrap_iv();
        let enc_key = self
            .key_storage
            .wrap_key(&aliases::biometric(safe_id), &iv, master.as_bytes())
            .await?;

        let material = BiometricCryptoMaterial {
            iv: iv.to_vec(),
            enc_key,
        };
        material.validate()?;
        Ok(material)
    }

    /// Delete the storage key of `safe_id`, logging failures
    pub(crate) async fn forget_key(&self, safe_id: SafeId) {
        if let Err(e) = self
            .key_storage
            .delete_key(&aliases::biometric(safe_id))
            .await
        {
            tracing::warn!("Could not delete biometric key of safe {}: {}", safe_id, e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::safe::test_support::{create_safe, password, TestEnv};

    #[tokio::test]
    async fn test_enroll_unwrap_roundtrip() {
        let env = TestEnv::new().await;
        let id = SafeId::new();
        let master = SymmetricKey::generate();

        let material = env.biometric.enroll_biometric(id, &master).await.unwrap();
        assert_eq!(material.iv.len(), BIOMETRIC_IV_SIZE);
        assert_eq!(material.enc_key.len(), BIOMETRIC_ENC_KEY_SIZE);

        let released = env.biometric.unwrap_biometric(id, &material).await.unwrap();
        assert!(released.ct_eq(&master));
    }

    #[tokio::test]
    async fn test_unlock_via_biometric() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "alpha").await;
        env.main.unlock(password("alpha")).await.unwrap();
        env.biometric.enable_biometric(id).await.unwrap();
        assert!(env.biometric.is_biometric_enabled(id).unwrap());
        env.main.lock();

        env.biometric.unlock_via_biometric(id).await.unwrap();
        assert_eq!(env.main.current_safe(), Some(id));
    }

    #[tokio::test]
    async fn test_denied_release_falls_back() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "alpha").await;
        env.main.unlock(password("alpha")).await.unwrap();
        env.biometric.enable_biometric(id).await.unwrap();
        env.main.lock();

        env.key_storage.set_available(false);
        let err = env.biometric.unlock_via_biometric(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BiometricUnavailable);
        assert!(!env.main.is_crypto_data_in_memory());

        env.key_storage.invalidate_biometric_keys();
        env.key_storage.set_available(true);
        let err = env.biometric.unlock_via_biometric(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BiometricUnavailable);

        env.main.unlock(password("alpha")).await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_clears_material_and_key() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "alpha").await;
        env.main.unlock(password("alpha")).await.unwrap();
        env.biometric.enable_biometric(id).await.unwrap();

        env.biometric.disable_biometric(id).await.unwrap();
        assert!(!env.biometric.is_biometric_enabled(id).unwrap());
        assert!(!env
            .key_storage
            .has_key(&aliases::biometric(id))
            .await
            .unwrap());

        env.main.lock();
        let err = env.biometric.unlock_via_biometric(id).await.unwrap_err();
        assert!(matches!(err, Error::BiometricNotEnabled(_)));
    }

    #[tokio::test]
    async fn test_enable_requires_unlocked_safe() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "alpha").await;
        let err = env.biometric.enable_biometric(id).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotLoaded(_)));
    }

    #[tokio::test]
    async fn test_password_change_rewraps() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "old").await;
        env.main.unlock(password("old")).await.unwrap();
        env.biometric.enable_biometric(id).await.unwrap();
        let before = env.database.require_safe_crypto(id).unwrap();

        env.edit.change_password(id, password("new")).await.unwrap();
        let after = env.database.require_safe_crypto(id).unwrap();
        assert_ne!(before.biometric_crypto_material, after.biometric_crypto_material);

        env.main.lock();
        env.biometric.unlock_via_biometric(id).await.unwrap();
        assert!(env.main.test_password(password("new")).await.unwrap());
    }

    #[tokio::test]
    async fn test_password_change_with_invalidated_key_clears_material() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "old").await;
        env.main.unlock(password("old")).await.unwrap();
        env.biometric.enable_biometric(id).await.unwrap();
        env.key_storage.invalidate_biometric_keys();

        let outcome = env.edit.change_password(id, password("new")).await.unwrap();
        assert!(outcome.biometric_disabled);
        assert!(!env.biometric.is_biometric_enabled(id).unwrap());
    }
}
