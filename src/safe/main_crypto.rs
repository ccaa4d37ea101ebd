//! # Main Crypto Repository
//!
//! Owns the in-memory keys of the unlocked safe and performs every
//! data-level encryption on its behalf.
//!
//! ## Session Key Slots
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SESSION KEY SLOTS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  unlock(password) ──► PBKDF2 per safe ──► encTest matches?             │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │ master       │  │ index        │  │ bubbles      │  │ edition    │  │
//! │  │ (at unlock)  │  │ (at unlock)  │  │ (lazy)       │  │ (lazy)     │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └────────────┘  │
//! │                                                                         │
//! │  All four slots belong to the same safe. lock() clears all of them     │
//! │  and drops the index cache.                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Purposes
//!
//! | Purpose | Key | AAD |
//! |---------|-----|-----|
//! | `Item(&ItemKey)` | item key, opened with the master key | none |
//! | `IndexWord` | index key | `index-word` |
//! | `RecentSearch` | index key | `recent-search` |
//! | `ItemEdition` | item-edition key | none |
//! | `Bubbles` | bubbles key | none |
//!
//! Data operations hold the shared side of the safe lock; password change
//! and destruction hold the exclusive side.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedRwLockReadGuard;
use zeroize::Zeroizing;

use super::index_cache::{IndexCache, IndexWordEntry, PlainIndexWord};
use super::locks::SafeLocks;
use super::{open_key, seal_key, verify_master_key, ItemKey, SafeCrypto, SafeId};
use crate::crypto::{
    decrypt_stream, derive_master_key_blocking, encrypt_stream, AeadEngine, DecryptReader,
    EncryptWriter, KdfConfig, KeySlot, Password, SymmetricKey,
};
use crate::error::{Error, Result};
use crate::storage::Database;

const INDEX_WORD_AAD: &[u8] = b"index-word";
const RECENT_SEARCH_AAD: &[u8] = b"recent-search";

/// What a piece of data is encrypted for
#[derive(Debug, Clone, Copy)]
pub enum CryptoPurpose<'a> {
    /// Item payload under its own item key
    Item(&'a ItemKey),
    /// Search index word
    IndexWord,
    /// Recent search query
    RecentSearch,
    /// File edition buffer
    ItemEdition,
    /// Bubbles data (contact local keys)
    Bubbles,
}

impl CryptoPurpose<'_> {
    fn label(&self) -> &'static str {
        match self {
            CryptoPurpose::Item(_) => "item key",
            CryptoPurpose::IndexWord => "index word",
            CryptoPurpose::RecentSearch => "recent search",
            CryptoPurpose::ItemEdition => "item-edition key",
            CryptoPurpose::Bubbles => "bubbles key",
        }
    }

    fn aad(&self) -> Option<&'static [u8]> {
        match self {
            CryptoPurpose::IndexWord => Some(INDEX_WORD_AAD),
            CryptoPurpose::RecentSearch => Some(RECENT_SEARCH_AAD),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum WorkingSlot {
    Index,
    Bubbles,
    ItemEdition,
}

struct SessionKeys {
    master: KeySlot,
    index: KeySlot,
    bubbles: KeySlot,
    item_edition: KeySlot,
}

impl SessionKeys {
    fn new() -> Self {
        Self {
            master: KeySlot::new("master key"),
            index: KeySlot::new("index key"),
            bubbles: KeySlot::new("bubbles key"),
            item_edition: KeySlot::new("item-edition key"),
        }
    }

    fn slot(&self, which: WorkingSlot) -> &KeySlot {
        match which {
            WorkingSlot::Index => &self.index,
            WorkingSlot::Bubbles => &self.bubbles,
            WorkingSlot::ItemEdition => &self.item_edition,
        }
    }

    fn slot_mut(&mut self, which: WorkingSlot) -> &mut KeySlot {
        match which {
            WorkingSlot::Index => &mut self.index,
            WorkingSlot::Bubbles => &mut self.bubbles,
            WorkingSlot::ItemEdition => &mut self.item_edition,
        }
    }

    fn clear(&mut self) {
        self.master.clear();
        self.index.clear();
        self.bubbles.clear();
        self.item_edition.clear();
    }
}

/// Unlock, key slots and data encryption for the active safe
pub struct MainCryptoRepository {
    database: Arc<Database>,
    engine: Arc<dyn AeadEngine>,
    kdf: KdfConfig,
    locks: Arc<SafeLocks>,
    keys: Mutex<SessionKeys>,
    index_cache: IndexCache,
}

impl MainCryptoRepository {
    /// Create a repository with nothing unlocked
    pub fn new(
        database: Arc<Database>,
        engine: Arc<dyn AeadEngine>,
        kdf: KdfConfig,
        locks: Arc<SafeLocks>,
        index_cache_ttl: Duration,
    ) -> Self {
        Self {
            database,
            engine,
            kdf,
            locks,
            keys: Mutex::new(SessionKeys::new()),
            index_cache: IndexCache::new(index_cache_ttl),
        }
    }

    // ========================================================================
    // UNLOCK & SESSION
    // ========================================================================

    /// Unlock whichever safe `password` belongs to
    pub async fn unlock(&self, password: Arc<Password>) -> Result<SafeId> {
        let (safe_id, master) = self
            .find_safe_for_password(password)
            .await?
            .ok_or(Error::WrongPassword)?;

        self.load_unlocked(safe_id, master)?;
        tracing::info!("Safe {} unlocked", safe_id);
        Ok(safe_id)
    }

    /// Unlock a known safe with its password
    pub async fn load_master_key_from_password(
        &self,
        safe_id: SafeId,
        password: Arc<Password>,
    ) -> Result<()> {
        let record = self.database.require_safe_crypto(safe_id)?;
        let master = derive_master_key_blocking(password, record.salt.clone(), self.kdf).await?;

        if !verify_master_key(self.engine.as_ref(), &record, &master)? {
            return Err(Error::WrongPassword);
        }

        self.load_unlocked(safe_id, master)?;
        tracing::info!("Safe {} unlocked", safe_id);
        Ok(())
    }

    /// Load a raw master key, as released by biometric unwrap
    pub fn load_master_key_external(&self, safe_id: SafeId, master: SymmetricKey) -> Result<()> {
        let record = self.database.require_safe_crypto(safe_id)?;
        if !verify_master_key(self.engine.as_ref(), &record, &master)? {
            return Err(Error::CryptoAuthFailure("master key".into()));
        }
        self.load_unlocked(safe_id, master)
    }

    /// Find the safe a raw master key belongs to
    pub fn get_safe_from_master_key(&self, master: &SymmetricKey) -> Result<Option<SafeId>> {
        for record in self.database.get_all_safe_crypto()? {
            if verify_master_key(self.engine.as_ref(), &record, master)? {
                return Ok(Some(record.id));
            }
        }
        Ok(None)
    }

    /// Check `password` against the unlocked safe
    pub async fn test_password(&self, password: Arc<Password>) -> Result<bool> {
        let safe_id = self.require_current_safe()?;
        let record = self.database.require_safe_crypto(safe_id)?;
        let candidate = derive_master_key_blocking(password, record.salt, self.kdf).await?;

        self.keys
            .lock()
            .master
            .with_key_for(safe_id, |master| master.ct_eq(&candidate))
    }

    /// Drop every in-memory key and the index cache
    pub fn lock(&self) {
        let previous = {
            let mut keys = self.keys.lock();
            let previous = keys.master.holder();
            keys.clear();
            previous
        };
        self.index_cache.clear();
        if let Some(safe_id) = previous {
            tracing::info!("Safe {} locked", safe_id);
        }
    }

    /// Whether a master key is loaded
    pub fn is_crypto_data_in_memory(&self) -> bool {
        !self.keys.lock().master.is_empty()
    }

    /// Safe whose keys are loaded
    pub fn current_safe(&self) -> Option<SafeId> {
        self.keys.lock().master.holder()
    }

    // ========================================================================
    // ITEM KEYS & DATA
    // ========================================================================

    /// Create, persist and return a fresh item key
    pub async fn generate_item_key(&self, item_id: &str) -> Result<ItemKey> {
        self.import_item_key(item_id, &SymmetricKey::generate()).await
    }

    /// Persist an existing raw item key under the master key
    pub async fn import_item_key(&self, item_id: &str, raw: &SymmetricKey) -> Result<ItemKey> {
        let (safe_id, _guard) = self.shared_session().await?;
        let enc_value = self
            .keys
            .lock()
            .master
            .with_key_for(safe_id, |master| seal_key(self.engine.as_ref(), raw, master))??;

        let item_key = ItemKey {
            id: item_id.to_string(),
            safe_id,
            enc_value,
        };
        self.database.save_item_key(&item_key)?;

        #[cfg(feature = "verbose-logging")]
        tracing::debug!("Item key {} stored for safe {}", item_id, safe_id);

        Ok(item_key)
    }

    /// Read an item key of the unlocked safe from storage
    pub fn get_item_key(&self, item_id: &str) -> Result<Option<ItemKey>> {
        let safe_id = self.require_current_safe()?;
        self.database.get_item_key(safe_id, item_id)
    }

    /// Encrypt `data` for `purpose`
    pub async fn encrypt(&self, data: &[u8], purpose: CryptoPurpose<'_>) -> Result<Vec<u8>> {
        let (_, _guard) = self.shared_session().await?;
        let key = self.key_for(purpose)?;
        self.engine
            .encrypt(data, key.as_bytes(), purpose.aad())
            .map_err(|e| e.with_context(purpose.label()))
    }

    /// Decrypt `data` produced by [`MainCryptoRepository::encrypt`] for the
    /// same purpose
    pub async fn decrypt(
        &self,
        data: &[u8],
        purpose: CryptoPurpose<'_>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (_, _guard) = self.shared_session().await?;
        let key = self.key_for(purpose)?;
        self.engine
            .decrypt(data, key.as_bytes(), purpose.aad())
            .map_err(|e| e.with_context(purpose.label()))
    }

    /// Encrypt and store an item payload
    pub async fn save_item_data(&self, item_key: &ItemKey, data: &[u8]) -> Result<()> {
        let enc = self.encrypt(data, CryptoPurpose::Item(item_key)).await?;
        self.database.save_item(item_key.safe_id, &item_key.id, &enc)
    }

    /// Load and decrypt an item payload
    pub async fn load_item_data(&self, item_key: &ItemKey) -> Result<Option<Zeroizing<Vec<u8>>>> {
        match self.database.get_item(item_key.safe_id, &item_key.id)? {
            Some(enc) => Ok(Some(self.decrypt(&enc, CryptoPurpose::Item(item_key)).await?)),
            None => Ok(None),
        }
    }

    /// Encrypting writer for an item attachment
    pub async fn item_encrypt_writer<W: Write>(
        &self,
        sink: W,
        item_key: &ItemKey,
    ) -> Result<EncryptWriter<W>> {
        self.stream_writer(sink, CryptoPurpose::Item(item_key)).await
    }

    /// Decrypting reader for an item attachment
    pub async fn item_decrypt_reader<R: Read>(
        &self,
        source: R,
        item_key: &ItemKey,
    ) -> Result<DecryptReader> {
        self.stream_reader(source, CryptoPurpose::Item(item_key)).await
    }

    /// Encrypting writer for a file being edited
    pub async fn edition_encrypt_writer<W: Write>(&self, sink: W) -> Result<EncryptWriter<W>> {
        self.stream_writer(sink, CryptoPurpose::ItemEdition).await
    }

    /// Decrypting reader for a file being edited
    pub async fn edition_decrypt_reader<R: Read>(&self, source: R) -> Result<DecryptReader> {
        self.stream_reader(source, CryptoPurpose::ItemEdition).await
    }

    async fn stream_writer<W: Write>(
        &self,
        sink: W,
        purpose: CryptoPurpose<'_>,
    ) -> Result<EncryptWriter<W>> {
        let (_, _guard) = self.shared_session().await?;
        let key = self.key_for(purpose)?;
        encrypt_stream(sink, &key, purpose.aad()).map_err(|e| e.with_context(purpose.label()))
    }

    async fn stream_reader<R: Read>(
        &self,
        source: R,
        purpose: CryptoPurpose<'_>,
    ) -> Result<DecryptReader> {
        let (_, _guard) = self.shared_session().await?;
        let key = self.key_for(purpose)?;
        decrypt_stream(source, &key, purpose.aad())
            .map_err(|e| e.with_context(purpose.label()))
    }

    // ========================================================================
    // INDEX & RECENT SEARCH
    // ========================================================================

    /// Encrypt one search index word
    pub async fn encrypt_index_word(&self, word: &str) -> Result<Vec<u8>> {
        self.encrypt(word.as_bytes(), CryptoPurpose::IndexWord).await
    }

    /// Decrypt index words, serving repeated ids from the cache
    ///
    /// Entries are cached by id; a caller that rewrites an entry in place
    /// must reuse a new id.
    pub async fn decrypt_index_words(&self, entries: &[IndexWordEntry]) -> Result<Vec<PlainIndexWord>> {
        let (safe_id, _guard) = self.shared_session().await?;
        let mut out = Vec::with_capacity(entries.len());
        let mut fresh = Vec::new();

        for entry in entries {
            if let Some(cached) = self.index_cache.get(safe_id, &entry.id) {
                out.push(cached);
                continue;
            }
            let key = self.key_for(CryptoPurpose::IndexWord)?;
            let plain = self
                .engine
                .decrypt(&entry.enc_word, key.as_bytes(), Some(INDEX_WORD_AAD))
                .map_err(|e| e.with_context("index word"))?;
            let word = String::from_utf8(plain.to_vec())
                .map_err(|_| Error::CorruptedVault(format!("index word {} is not UTF-8", entry.id)))?;
            let word = PlainIndexWord {
                id: entry.id.clone(),
                word,
            };
            fresh.push(word.clone());
            out.push(word);
        }

        if !fresh.is_empty() {
            self.index_cache.insert_all(safe_id, fresh);
        } else {
            self.index_cache.touch();
        }
        Ok(out)
    }

    /// The decrypted-word cache
    pub fn index_cache(&self) -> &IndexCache {
        &self.index_cache
    }

    /// Encrypt a recent search query
    pub async fn encrypt_recent_search(&self, query: &str) -> Result<Vec<u8>> {
        self.encrypt(query.as_bytes(), CryptoPurpose::RecentSearch).await
    }

    /// Decrypt a recent search query
    pub async fn decrypt_recent_search(&self, enc: &[u8]) -> Result<Zeroizing<String>> {
        let plain = self.decrypt(enc, CryptoPurpose::RecentSearch).await?;
        String::from_utf8(plain.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| Error::CorruptedVault("recent search is not UTF-8".into()))
    }

    // ========================================================================
    // CRATE-INTERNAL HELPERS
    // ========================================================================
    //
    // None of these take the safe lock; callers that already hold the
    // exclusive side (rotation, destruction) use them directly.

    pub(crate) fn engine(&self) -> &Arc<dyn AeadEngine> {
        &self.engine
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub(crate) fn locks(&self) -> &Arc<SafeLocks> {
        &self.locks
    }

    pub(crate) fn kdf(&self) -> KdfConfig {
        self.kdf
    }

    /// Try `password` against every safe on the device
    ///
    /// A tag mismatch on a test marker only means "not this safe".
    pub(crate) async fn find_safe_for_password(
        &self,
        password: Arc<Password>,
    ) -> Result<Option<(SafeId, SymmetricKey)>> {
        for record in self.database.get_all_safe_crypto()? {
            let candidate =
                derive_master_key_blocking(password.clone(), record.salt.clone(), self.kdf).await?;
            if verify_master_key(self.engine.as_ref(), &record, &candidate)? {
                return Ok(Some((record.id, candidate)));
            }
        }
        Ok(None)
    }

    /// Run `f` with the master key of `safe_id`
    pub(crate) fn with_master_key<T>(
        &self,
        safe_id: SafeId,
        f: impl FnOnce(&SymmetricKey) -> T,
    ) -> Result<T> {
        self.keys.lock().master.with_key_for(safe_id, f)
    }

    /// Replace the master key after a committed rotation
    ///
    /// Working keys survive rotation unchanged, so their slots stay valid.
    pub(crate) fn swap_master_key(&self, safe_id: SafeId, master: SymmetricKey) -> Result<()> {
        self.keys.lock().master.replace_after_commit(safe_id, master)
    }

    /// Drop the session if it belongs to `safe_id`
    pub(crate) fn forget_safe(&self, safe_id: SafeId) {
        if self.current_safe() == Some(safe_id) {
            self.lock();
        }
    }

    /// Fill the master and index slots; the index key is needed by every
    /// search, the other working keys wait for first use.
    ///
    /// Unlocking a different safe locks the current one first. Loading the
    /// safe that is already open fails with `KeyAlreadyLoaded`.
    fn load_unlocked(&self, safe_id: SafeId, master: SymmetricKey) -> Result<()> {
        let record = self.database.require_safe_crypto(safe_id)?;
        let index = open_key(self.engine.as_ref(), &record.enc_index_key, &master, "index key")?;

        let switched_from = {
            let mut keys = self.keys.lock();
            let previous = keys.master.holder().filter(|current| *current != safe_id);
            if previous.is_some() {
                keys.clear();
            }
            keys.master.load(safe_id, master)?;
            if let Err(e) = keys.index.load(safe_id, index) {
                keys.clear();
                return Err(e);
            }
            previous
        };

        if let Some(previous) = switched_from {
            self.index_cache.clear();
            tracing::info!("Safe {} locked to switch to {}", previous, safe_id);
        }
        Ok(())
    }

    fn require_current_safe(&self) -> Result<SafeId> {
        self.current_safe().ok_or(Error::KeyNotLoaded("master key"))
    }

    /// Take the shared lock of the unlocked safe
    ///
    /// The holder is re-checked after the wait, since a lock or a
    /// destruction may have run meanwhile.
    async fn shared_session(&self) -> Result<(SafeId, OwnedRwLockReadGuard<()>)> {
        let safe_id = self.require_current_safe()?;
        let guard = self.locks.read(safe_id).await;
        match self.current_safe() {
            Some(current) if current == safe_id => Ok((safe_id, guard)),
            Some(_) => Err(Error::SafeMismatch("master key")),
            None => Err(Error::KeyNotLoaded("master key")),
        }
    }

    fn key_for(&self, purpose: CryptoPurpose<'_>) -> Result<SymmetricKey> {
        match purpose {
            CryptoPurpose::Item(item_key) => self.open_item_key(item_key),
            CryptoPurpose::IndexWord | CryptoPurpose::RecentSearch => {
                self.working_key(WorkingSlot::Index)
            }
            CryptoPurpose::ItemEdition => self.working_key(WorkingSlot::ItemEdition),
            CryptoPurpose::Bubbles => self.working_key(WorkingSlot::Bubbles),
        }
    }

    fn open_item_key(&self, item_key: &ItemKey) -> Result<SymmetricKey> {
        self.keys.lock().master.with_key_for(item_key.safe_id, |master| {
            open_key(self.engine.as_ref(), &item_key.enc_value, master, "item key")
        })?
    }

    /// Load a working key on first use
    fn working_key(&self, which: WorkingSlot) -> Result<SymmetricKey> {
        let safe_id = {
            let keys = self.keys.lock();
            let safe_id = keys.master.holder().ok_or(Error::KeyNotLoaded("master key"))?;
            if let Ok(key) = keys.slot(which).with_key_for(safe_id, SymmetricKey::clone) {
                return Ok(key);
            }
            safe_id
        };

        let record = self.database.require_safe_crypto(safe_id)?;

        let mut keys = self.keys.lock();
        let key = keys.master.with_key_for(safe_id, |master| {
            open_working_key(self.engine.as_ref(), &record, which, master)
        })??;

        let slot = keys.slot_mut(which);
        if slot.is_empty() {
            slot.load(safe_id, key.clone())?;
        }
        Ok(key)
    }
}

fn open_working_key(
    engine: &dyn AeadEngine,
    record: &SafeCrypto,
    which: WorkingSlot,
    master: &SymmetricKey,
) -> Result<SymmetricKey> {
    match which {
        WorkingSlot::Index => open_key(engine, &record.enc_index_key, master, "index key"),
        WorkingSlot::Bubbles => open_key(engine, &record.enc_bubbles_key, master, "bubbles key"),
        WorkingSlot::ItemEdition => {
            open_key(engine, &record.enc_item_edition_key, master, "item-edition key")
        }
    }
}

impl std::fmt::Debug for MainCryptoRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainCryptoRepository")
            .field("current_safe", &self.current_safe())
            .field("backend", &self.engine.backend())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
