//! # Auto-Destruction Trap
//!
//! A decoy password that, when entered at login, silently deletes the safe
//! it was configured for.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      AUTO-DESTRUCTION                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  enable:  key = hex(SHA-256(hex(salt) || decoy))  ──► safe_crypto      │
//! │                                                                         │
//! │  login:   for every safe with a key                                    │
//! │               candidate = hex(SHA-256(hex(salt) || entered))           │
//! │               candidate == key (constant time)?                        │
//! │                   └── yes ──► delete safe, clear session               │
//! │                                                                         │
//! │  The caller then reports a wrong password.                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use subtle::ConstantTimeEq;

use super::edit_crypto::EditCryptoRepository;
use super::main_crypto::MainCryptoRepository;
use super::SafeId;
use crate::crypto::{derive_auto_destruction_key, Password};
use crate::error::{Error, Result};
use crate::storage::{AutoDestructionEntry, Database};

/// Duress password handling
pub struct AutoDestructionTrap {
    main: Arc<MainCryptoRepository>,
    edit: Arc<EditCryptoRepository>,
}

impl AutoDestructionTrap {
    /// Create a trap over the given repositories
    pub fn new(main: Arc<MainCryptoRepository>, edit: Arc<EditCryptoRepository>) -> Self {
        Self { main, edit }
    }

    /// Configure `decoy` as the destruction password of the unlocked safe
    ///
    /// A decoy that unlocks any safe is rejected with
    /// [`Error::PasswordAlreadyUsed`].
    pub async fn enable_auto_destruction(&self, safe_id: SafeId, decoy: Arc<Password>) -> Result<()> {
        let _guard = self.main.locks().write(safe_id).await;
        self.main.with_master_key(safe_id, |_| ())?;

        let _registry = self.edit.password_registry().await;
        if self.main.find_safe_for_password(decoy.clone()).await?.is_some() {
            return Err(Error::PasswordAlreadyUsed);
        }

        let record = self.main.database().require_safe_crypto(safe_id)?;
        let key = derive_auto_destruction_key(&decoy, &record.salt_string());
        self.main
            .database()
            .set_auto_destruction_key(safe_id, Some(key.as_bytes()))?;

        tracing::info!("Auto-destruction enabled for safe {}", safe_id);
        Ok(())
    }

    /// Remove the destruction password of a safe
    pub async fn disable_auto_destruction(&self, safe_id: SafeId) -> Result<()> {
        let _guard = self.main.locks().write(safe_id).await;
        self.main.database().set_auto_destruction_key(safe_id, None)?;
        tracing::info!("Auto-destruction disabled for safe {}", safe_id);
        Ok(())
    }

    /// Whether the safe has a destruction password
    pub fn is_auto_destruction_enabled(&self, safe_id: SafeId) -> Result<bool> {
        Ok(self
            .main
            .database()
            .require_safe_crypto(safe_id)?
            .auto_destruction_key
            .is_some())
    }

    /// Delete every safe whose destruction password is `entered`
    ///
    /// Returns the ids of the deleted safes; empty when nothing matched.
    pub async fn check_and_execute_auto_destruction(&self, entered: &Password) -> Result<Vec<SafeId>> {
        let matched: Vec<SafeId> = self
            .main
            .database()
            .get_auto_destruction_entries()?
            .iter()
            .filter(|entry| entry_matches(entry, entered))
            .map(|entry| entry.safe_id)
            .collect();

        let mut destroyed = Vec::with_capacity(matched.len());
        for safe_id in matched {
            if self.edit.delete_safe(safe_id).await? {
                tracing::warn!("Auto-destruction executed for safe {}", safe_id);
                destroyed.push(safe_id);
            }
        }
        Ok(destroyed)
    }
}

fn entry_matches(entry: &AutoDestructionEntry, entered: &Password) -> bool {
    let candidate = derive_auto_destruction_key(entered, &hex::encode(&entry.salt));
    candidate.as_bytes().ct_eq(entry.key.as_slice()).into()
}

/// Whether `password` is the destruction password of any safe
pub(crate) fn matches_any_trap(database: &Database, password: &Password) -> Result<bool> {
    Ok(database
        .get_auto_destruction_entries()?
        .iter()
        .any(|entry| entry_matches(entry, password)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::safe::test_support::{create_safe, password, TestEnv};
    use crate::safe::OnboardingOutcome;

    #[tokio::test]
    async fn test_decoy_destroys_only_its_safe() {
        let env = TestEnv::new().await;
        let keep = create_safe(&env, "keep").await;
        let doomed = create_safe(&env, "real").await;

        env.main.unlock(password("real")).await.unwrap();
        env.main.generate_item_key("item").await.unwrap();
        env.trap.enable_auto_destruction(doomed, password("decoy")).await.unwrap();
        assert!(env.trap.is_auto_destruction_enabled(doomed).unwrap());

        let destroyed = env
            .trap
            .check_and_execute_auto_destruction(&Password::from("decoy"))
            .await
            .unwrap();
        assert_eq!(destroyed, vec![doomed]);

        assert!(!env.main.is_crypto_data_in_memory());
        assert!(env.database.get_safe_crypto(doomed).unwrap().is_none());
        assert!(env.database.get_all_item_keys(doomed).unwrap().is_empty());
        assert!(env.database.get_safe_crypto(keep).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_passwords_do_nothing() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "real").await;
        env.main.unlock(password("real")).await.unwrap();
        env.trap.enable_auto_destruction(id, password("decoy")).await.unwrap();

        for entered in ["real", "decoy ", "Decoy", ""] {
            let destroyed = env
                .trap
                .check_and_execute_auto_destruction(&Password::from(entered))
                .await
                .unwrap();
            assert!(destroyed.is_empty());
        }
        assert!(env.main.is_crypto_data_in_memory());
    }

    #[tokio::test]
    async fn test_decoy_must_not_unlock_a_safe() {
        let env = TestEnv::new().await;
        create_safe(&env, "other").await;
        let id = create_safe(&env, "real").await;
        env.main.unlock(password("real")).await.unwrap();

        let err = env
            .trap
            .enable_auto_destruction(id, password("other"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PasswordAlreadyUsed);
        assert!(!env.trap.is_auto_destruction_enabled(id).unwrap());
    }

    #[tokio::test]
    async fn test_decoy_blocks_new_safe_password() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "real").await;
        env.main.unlock(password("real")).await.unwrap();
        env.trap.enable_auto_destruction(id, password("decoy")).await.unwrap();

        let outcome = env.edit.generate_cryptographic_data(password("decoy")).await.unwrap();
        assert!(matches!(outcome, OnboardingOutcome::PasswordAlreadyUsed));
    }

    #[tokio::test]
    async fn test_disable_and_password_change_clear_trap() {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "real").await;
        env.main.unlock(password("real")).await.unwrap();

        env.trap.enable_auto_destruction(id, password("decoy")).await.unwrap();
        env.trap.disable_auto_destruction(id).await.unwrap();
        assert!(!env.trap.is_auto_destruction_enabled(id).unwrap());

        env.trap.enable_auto_destruction(id, password("decoy")).await.unwrap();
        env.edit.change_password(id, password("new")).await.unwrap();
        assert!(!env.trap.is_auto_destruction_enabled(id).unwrap());

        let destroyed = env
            .trap
            .check_and_execute_auto_destruction(&Password::from("decoy"))
            .await
            .unwrap();
        assert!(destroyed.is_empty());
    }

    #[test]
    fn test_stored_key_format() {
        let salt = vec![0xabu8; 16];
        let key = derive_auto_destruction_key(&Password::from("decoy"), &hex::encode(&salt));
        let entry = AutoDestructionEntry {
            safe_id: SafeId::new(),
            salt,
            key: key.as_bytes().to_vec(),
        };
        assert_eq!(entry.key.len(), 64);
        assert!(entry_matches(&entry, &Password::from("decoy")));
        assert!(!entry_matches(&entry, &Password::from("decoy2")));
    }
}
