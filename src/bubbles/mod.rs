//! # Bubbles Module
//!
//! Contact keys for peer-to-peer secure messaging.
//!
//! ## Key Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BUBBLES KEYS                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Bubbles key (working key of the safe)                                 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ContactLocalKey (one per contact)                                     │
//! │        │                                                                │
//! │        ├──► ContactSharedKey (ratchet handshake result)                │
//! │        ├──► EncConversation fields                                     │
//! │        └──► skipped message keys                                       │
//! │                                                                         │
//! │  Queue key (one per safe, in the secure datastore)                     │
//! │        └──► messages written before a session exists                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Attribution
//!
//! | Operation | Failure |
//! |-----------|---------|
//! | local decrypt | `CryptoAuthFailure` ("contact local key") |
//! | queue decrypt | `CryptoAuthFailure` ("queue key") |
//! | shared encrypt/decrypt | `BadContactKey` |

mod conversation;

pub use conversation::{Conversation, EncConversation};

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{derive_uuid_key, AeadEngine, SymmetricKey};
use crate::error::{Error, Result};
use crate::safe::{CryptoPurpose, MainCryptoRepository, SafeId};
use crate::storage::{Database, SecureDataStore};

/// Per-contact key, encrypted under the bubbles key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactLocalKey {
    /// Raw key under the bubbles key
    pub enc_key: Vec<u8>,
}

/// Ratchet shared secret, encrypted under the contact local key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactSharedKey {
    /// Raw secret under the contact local key
    pub enc_key: Vec<u8>,
}

/// Persisted contact keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    /// Contact identifier
    pub id: String,
    /// Owning safe
    pub safe_id: SafeId,
    /// Local key of the contact
    pub local_key: ContactLocalKey,
    /// Shared key, once the handshake completed
    pub shared_key: Option<ContactSharedKey>,
}

fn queue_key_name(safe_id: SafeId) -> String {
    format!("bubbles.queue-key.{}", safe_id)
}

/// Contact-key encryption for the unlocked safe
pub struct BubblesCryptoRepository {
    main: Arc<MainCryptoRepository>,
    datastore: Arc<SecureDataStore>,
    queue_key_lock: Mutex<()>,
}

impl BubblesCryptoRepository {
    /// Create a repository over the session repository and datastore
    pub fn new(main: Arc<MainCryptoRepository>, datastore: Arc<SecureDataStore>) -> Self {
        Self {
            main,
            datastore,
            queue_key_lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // LOCAL KEYS
    // ========================================================================

    /// Create a random local key for a new contact
    pub async fn generate_local_key_for_contact(&self) -> Result<ContactLocalKey> {
        let key = SymmetricKey::generate();
        let enc_key = self.main.encrypt(key.as_bytes(), CryptoPurpose::Bubbles).await?;
        Ok(ContactLocalKey { enc_key })
    }

    /// Encrypt `data` with a contact local key
    pub async fn local_encrypt(&self, key: &ContactLocalKey, data: &[u8]) -> Result<Vec<u8>> {
        let raw = self.open_local_key(key).await?;
        self.engine().encrypt(data, raw.as_bytes(), None)
    }

    /// Encrypt several optional values with one local key opening
    pub async fn local_encrypt_all(
        &self,
        key: &ContactLocalKey,
        entries: &[Option<&[u8]>],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let raw = self.open_local_key(key).await?;
        entries
            .iter()
            .map(|entry| {
                entry
                    .map(|data| self.engine().encrypt(data, raw.as_bytes(), None))
                    .transpose()
            })
            .collect()
    }

    /// Decrypt `data` with a contact local key
    pub async fn local_decrypt(&self, key: &ContactLocalKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let raw = self.open_local_key(key).await?;
        self.engine()
            .decrypt(data, raw.as_bytes(), None)
            .map_err(|e| e.with_context("contact local key"))
    }

    /// Decrypt several optional values with one local key opening
    pub async fn local_decrypt_all(
        &self,
        key: &ContactLocalKey,
        entries: &[Option<&[u8]>],
    ) -> Result<Vec<Option<Zeroizing<Vec<u8>>>>> {
        let raw = self.open_local_key(key).await?;
        entries
            .iter()
            .map(|entry| {
                entry
                    .map(|data| {
                        self.engine()
                            .decrypt(data, raw.as_bytes(), None)
                            .map_err(|e| e.with_context("contact local key"))
                    })
                    .transpose()
            })
            .collect()
    }

    async fn open_local_key(&self, key: &ContactLocalKey) -> Result<SymmetricKey> {
        let raw = self.main.decrypt(&key.enc_key, CryptoPurpose::Bubbles).await?;
        SymmetricKey::from_slice(&raw)
            .map_err(|_| Error::CorruptedVault("contact local key has bad length".into()))
    }

    // ========================================================================
    // SHARED KEYS
    // ========================================================================

    /// Protect a ratchet shared secret under the contact local key
    pub async fn seal_shared_key(
        &self,
        local_key: &ContactLocalKey,
        shared_secret: &[u8],
    ) -> Result<ContactSharedKey> {
        let enc_key = self.local_encrypt(local_key, shared_secret).await?;
        Ok(ContactSharedKey { enc_key })
    }

    /// Encrypt `data` with the shared key of a contact
    pub async fn shared_encrypt(
        &self,
        data: &[u8],
        local_key: &ContactLocalKey,
        shared_key: &ContactSharedKey,
    ) -> Result<Vec<u8>> {
        let secret = self.open_shared_key(local_key, shared_key).await?;
        self.engine()
            .encrypt(data, &secret, None)
            .map_err(|e| Error::BadContactKey(format!("shared encrypt failed: {}", e)))
    }

    /// Decrypt `data` with the shared key of a contact
    ///
    /// Any failure is a [`Error::BadContactKey`], so callers can tell a
    /// handshake desync from a transient problem.
    pub async fn shared_decrypt(
        &self,
        data: &[u8],
        local_key: &ContactLocalKey,
        shared_key: &ContactSharedKey,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let secret = self.open_shared_key(local_key, shared_key).await?;
        self.engine()
            .decrypt(data, &secret, None)
            .map_err(|_| Error::BadContactKey("message does not open with the shared key".into()))
    }

    async fn open_shared_key(
        &self,
        local_key: &ContactLocalKey,
        shared_key: &ContactSharedKey,
    ) -> Result<Zeroizing<Vec<u8>>> {
        match self.local_decrypt(local_key, &shared_key.enc_key).await {
            Ok(secret) => Ok(secret),
            Err(Error::CryptoAuthFailure(_)) => Err(Error::BadContactKey(
                "shared key does not open with the local key".into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Derive `len` bytes of key material from a contact UUID
    pub fn derive_uuid_key(&self, uuid: &Uuid, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        derive_uuid_key(uuid, len)
    }

    // ========================================================================
    // QUEUE KEY
    // ========================================================================

    /// Encrypt a message queued before a session exists
    pub async fn queue_encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.get_or_create_queue_key().await?;
        self.engine().encrypt(data, key.as_bytes(), None)
    }

    /// Decrypt a queued message
    pub async fn queue_decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.get_or_create_queue_key().await?;
        self.engine()
            .decrypt(data, key.as_bytes(), None)
            .map_err(|e| e.with_context("queue key"))
    }

    async fn get_or_create_queue_key(&self) -> Result<SymmetricKey> {
        let safe_id = self
            .main
            .current_safe()
            .ok_or(Error::KeyNotLoaded("master key"))?;
        let name = queue_key_name(safe_id);

        let _guard = self.queue_key_lock.lock().await;
        if let Some(raw) = self.datastore.get(&name).await? {
            return SymmetricKey::from_slice(&raw)
                .map_err(|_| Error::CorruptedVault("queue key has bad length".into()));
        }

        let key = SymmetricKey::generate();
        self.datastore.put(&name, Some(safe_id), key.as_bytes()).await?;
        tracing::info!("Queue key created for safe {}", safe_id);
        Ok(key)
    }

    /// Forget the queue key of a safe
    pub fn delete_bubbles_crypto(&self, safe_id: SafeId) -> Result<()> {
        self.datastore.delete(&queue_key_name(safe_id))?;
        Ok(())
    }

    // ========================================================================
    // CONTACTS
    // ========================================================================

    /// Persist the keys of a contact of the unlocked safe
    pub fn save_contact(
        &self,
        contact_id: &str,
        local_key: ContactLocalKey,
        shared_key: Option<ContactSharedKey>,
    ) -> Result<ContactRecord> {
        let safe_id = self
            .main
            .current_safe()
            .ok_or(Error::KeyNotLoaded("master key"))?;
        let record = ContactRecord {
            id: contact_id.to_string(),
            safe_id,
            local_key,
            shared_key,
        };
        self.database().save_contact(&record)?;
        Ok(record)
    }

    /// Load a contact of the unlocked safe
    pub fn get_contact(&self, contact_id: &str) -> Result<ContactRecord> {
        let not_found = || Error::ContactNotFound(contact_id.to_string());
        let safe_id = self.main.current_safe().ok_or_else(not_found)?;
        self.database()
            .get_contact(safe_id, contact_id)?
            .ok_or_else(not_found)
    }

    /// Store the handshake result of a contact
    pub async fn set_shared_key(&self, contact_id: &str, shared_secret: &[u8]) -> Result<ContactRecord> {
        let mut record = self.get_contact(contact_id)?;
        record.shared_key = Some(self.seal_shared_key(&record.local_key, shared_secret).await?);
        self.database().save_contact(&record)?;
        Ok(record)
    }

    fn engine(&self) -> &Arc<dyn AeadEngine> {
        self.main.engine()
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        self.main.database()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::safe::test_support::{create_safe, password, TestEnv};
    use crate::storage::SecureKeyStorage;

    pub(crate) fn bubbles_for(env: &TestEnv) -> BubblesCryptoRepository {
        let storage: Arc<dyn SecureKeyStorage> = env.key_storage.clone();
        let datastore = Arc::new(SecureDataStore::new(env.database.clone(), storage));
        BubblesCryptoRepository::new(env.main.clone(), datastore)
    }

    async fn unlocked() -> (TestEnv, SafeId) {
        let env = TestEnv::new().await;
        let id = create_safe(&env, "alpha").await;
        env.main.unlock(password("alpha")).await.unwrap();
        (env, id)
    }

    #[tokio::test]
    async fn test_local_roundtrip() {
        let (env, _) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let key = bubbles.generate_local_key_for_contact().await.unwrap();

        let enc = bubbles.local_encrypt(&key, b"contact name").await.unwrap();
        let plain = bubbles.local_decrypt(&key, &enc).await.unwrap();
        assert_eq!(plain.as_slice(), b"contact name");

        let other = bubbles.generate_local_key_for_contact().await.unwrap();
        let err = bubbles.local_decrypt(&other, &enc).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoAuthFailure);
        assert!(err.to_string().contains("contact local key"));
    }

    #[tokio::test]
    async fn test_batch_keeps_absent_entries() {
        let (env, _) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let key = bubbles.generate_local_key_for_contact().await.unwrap();

        let enc = bubbles
            .local_encrypt_all(&key, &[Some(b"a".as_slice()), None, Some(b"c".as_slice())])
            .await
            .unwrap();
        assert!(enc[1].is_none());

        let refs: Vec<Option<&[u8]>> = enc.iter().map(|e| e.as_deref()).collect();
        let plain = bubbles.local_decrypt_all(&key, &refs).await.unwrap();
        assert_eq!(plain[0].as_deref().map(Vec::as_slice), Some(&b"a"[..]));
        assert!(plain[1].is_none());
        assert_eq!(plain[2].as_deref().map(Vec::as_slice), Some(&b"c"[..]));
    }

    #[tokio::test]
    async fn test_shared_roundtrip_and_bad_contact_key() {
        let (env, _) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let local = bubbles.generate_local_key_for_contact().await.unwrap();
        let shared = bubbles.seal_shared_key(&local, &[9u8; 32]).await.unwrap();

        let enc = bubbles.shared_encrypt(b"hello", &local, &shared).await.unwrap();
        let plain = bubbles.shared_decrypt(&enc, &local, &shared).await.unwrap();
        assert_eq!(plain.as_slice(), b"hello");

        let other_shared = bubbles.seal_shared_key(&local, &[8u8; 32]).await.unwrap();
        let err = bubbles.shared_decrypt(&enc, &local, &other_shared).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadContactKey);

        let other_local = bubbles.generate_local_key_for_contact().await.unwrap();
        let err = bubbles.shared_decrypt(&enc, &other_local, &shared).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadContactKey);
    }

    #[tokio::test]
    async fn test_queue_key_is_created_once() {
        let (env, id) = unlocked().await;
        let bubbles = bubbles_for(&env);

        let enc = bubbles.queue_encrypt(b"queued").await.unwrap();
        let stored = env.database.datastore_get(&queue_key_name(id)).unwrap();
        assert!(stored.is_some());

        let plain = bubbles.queue_decrypt(&enc).await.unwrap();
        assert_eq!(plain.as_slice(), b"queued");
        assert_eq!(env.database.datastore_get(&queue_key_name(id)).unwrap(), stored);
    }

    #[tokio::test]
    async fn test_queue_key_survives_restart_of_repository() {
        let (env, _) = unlocked().await;
        let enc = bubbles_for(&env).queue_encrypt(b"queued").await.unwrap();
        let plain = bubbles_for(&env).queue_decrypt(&enc).await.unwrap();
        assert_eq!(plain.as_slice(), b"queued");
    }

    #[tokio::test]
    async fn test_deleted_queue_key_breaks_old_messages() {
        let (env, id) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let enc = bubbles.queue_encrypt(b"queued").await.unwrap();

        bubbles.delete_bubbles_crypto(id).unwrap();
        let err = bubbles.queue_decrypt(&enc).await.unwrap_err();
        assert!(err.to_string().contains("queue key"));
    }

    #[tokio::test]
    async fn test_contact_persistence() {
        let (env, _) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let local = bubbles.generate_local_key_for_contact().await.unwrap();

        bubbles.save_contact("bob", local.clone(), None).unwrap();
        assert!(bubbles.get_contact("bob").unwrap().shared_key.is_none());

        let record = bubbles.set_shared_key("bob", &[3u8; 32]).await.unwrap();
        let enc = bubbles
            .shared_encrypt(b"hi", &record.local_key, record.shared_key.as_ref().unwrap())
            .await
            .unwrap();

        let loaded = bubbles.get_contact("bob").unwrap();
        let plain = bubbles
            .shared_decrypt(&enc, &loaded.local_key, loaded.shared_key.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(plain.as_slice(), b"hi");

        let err = bubbles.get_contact("carol").unwrap_err();
        assert!(matches!(err, Error::ContactNotFound(_)));
    }

    #[tokio::test]
    async fn test_contact_ids_are_scoped_per_safe() {
        let env = TestEnv::new().await;
        let alpha = create_safe(&env, "alpha").await;
        let bravo = create_safe(&env, "bravo").await;
        let bubbles = bubbles_for(&env);

        env.main.unlock(password("alpha")).await.unwrap();
        let alpha_local = bubbles.generate_local_key_for_contact().await.unwrap();
        bubbles.save_contact("bob", alpha_local.clone(), None).unwrap();
        let sealed = bubbles.local_encrypt(&alpha_local, b"for alpha").await.unwrap();
        env.main.lock();

        env.main.unlock(password("bravo")).await.unwrap();
        let bravo_local = bubbles.generate_local_key_for_contact().await.unwrap();
        bubbles.save_contact("bob", bravo_local, None).unwrap();
        assert_eq!(bubbles.get_contact("bob").unwrap().safe_id, bravo);
        env.main.lock();

        env.main.unlock(password("alpha")).await.unwrap();
        let bob = bubbles.get_contact("bob").unwrap();
        assert_eq!(bob.safe_id, alpha);
        let plain = bubbles.local_decrypt(&bob.local_key, &sealed).await.unwrap();
        assert_eq!(plain.as_slice(), b"for alpha");
    }

    #[tokio::test]
    async fn test_uuid_key_is_deterministic() {
        let (env, _) = unlocked().await;
        let bubbles = bubbles_for(&env);
        let id = Uuid::new_v4();
        assert_eq!(
            bubbles.derive_uuid_key(&id, 32).unwrap(),
            bubbles.derive_uuid_key(&id, 32).unwrap()
        );
    }

    #[tokio::test]
    async fn test_requires_unlocked_safe() {
        let env = TestEnv::new().await;
        create_safe(&env, "alpha").await;
        let bubbles = bubbles_for(&env);

        let err = bubbles.generate_local_key_for_contact().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
        let err = bubbles.queue_encrypt(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
    }
}
