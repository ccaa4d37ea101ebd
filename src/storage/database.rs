//! # Database
//!
//! SQLite persistence for key bundles, item keys and bubbles data.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │  Repositories   │                                                   │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    Database     │  High-level API                                   │
//! │  │   (this file)   │  - Safe crypto records                            │
//! │  │                 │  - Item keys / items                              │
//! │  │                 │  - Contacts, conversations, message keys          │
//! │  │                 │  - with_transaction (all-or-nothing)              │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │   SQLite DB     │  - In-memory for tests                            │
//! │  │                 │  - File for production                            │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Row helpers that may run inside a transaction are associated functions
//! taking a `&Connection`; a `rusqlite::Transaction` derefs to one.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::sync::Arc;

use super::schema;
use crate::bubbles::{ContactLocalKey, ContactRecord, ContactSharedKey, EncConversation};
use crate::error::{Error, Result};
use crate::safe::{BiometricCryptoMaterial, ItemKey, SafeCrypto, SafeId};

/// Auto-destruction entry of one safe
#[derive(Debug, Clone)]
pub struct AutoDestructionEntry {
    /// Safe the trap belongs to
    pub safe_id: SafeId,
    /// Salt of that safe
    pub salt: Vec<u8>,
    /// Stored comparison key
    pub key: Vec<u8>,
}

/// The main database handle
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub async fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.execute_batch(schema::CONNECTION_PRAGMAS)
            .map_err(|e| Error::DatabaseError(format!("Failed to configure connection: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::DatabaseError(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema at version {}", v);
            }
        }

        Ok(())
    }

    /// Run `f` inside a transaction
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err` or
    /// panics.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let value = f(&tx)?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    // ========================================================================
    // SAFE CRYPTO OPERATIONS
    // ========================================================================

    /// Insert a new key bundle
    pub fn insert_safe_crypto(&self, record: &SafeCrypto) -> Result<()> {
        record.validate()?;
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp();
        let (iv, enc_key) = split_biometric(record.biometric_crypto_material.as_ref());

        conn.execute(
            "INSERT INTO safe_crypto (id, salt, enc_test, enc_index_key, enc_bubbles_key,
                enc_item_edition_key, biometric_iv, biometric_enc_key, auto_destruction_key,
                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id.to_string(),
                record.salt,
                record.enc_test,
                record.enc_index_key,
                record.enc_bubbles_key,
                record.enc_item_edition_key,
                iv,
                enc_key,
                record.auto_destruction_key,
                now,
                now,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to insert safe crypto: {}", e)))?;

        Ok(())
    }

    /// Overwrite every field of an existing key bundle
    pub fn write_safe_crypto(conn: &Connection, record: &SafeCrypto) -> Result<()> {
        record.validate()?;
        let (iv, enc_key) = split_biometric(record.biometric_crypto_material.as_ref());

        let updated = conn
            .execute(
                "UPDATE safe_crypto SET salt = ?, enc_test = ?, enc_index_key = ?,
                    enc_bubbles_key = ?, enc_item_edition_key = ?, biometric_iv = ?,
                    biometric_enc_key = ?, auto_destruction_key = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    record.salt,
                    record.enc_test,
                    record.enc_index_key,
                    record.enc_bubbles_key,
                    record.enc_item_edition_key,
                    iv,
                    enc_key,
                    record.auto_destruction_key,
                    crate::time::now_timestamp(),
                    record.id.to_string(),
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update safe crypto: {}", e)))?;

        if updated == 0 {
            return Err(Error::SafeNotFound(record.id));
        }
        Ok(())
    }

    /// Get the key bundle of a safe
    pub fn get_safe_crypto(&self, safe_id: SafeId) -> Result<Option<SafeCrypto>> {
        let conn = self.conn.lock();

        let result = conn
            .query_row(
                "SELECT id, salt, enc_test, enc_index_key, enc_bubbles_key, enc_item_edition_key,
                    biometric_iv, biometric_enc_key, auto_destruction_key
                 FROM safe_crypto WHERE id = ?",
                params![safe_id.to_string()],
                safe_crypto_from_row,
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get safe crypto: {}", e)))?;

        result.map(|record| record.and_then(checked)).transpose()
    }

    /// Get the key bundle of a safe, failing if it does not exist
    pub fn require_safe_crypto(&self, safe_id: SafeId) -> Result<SafeCrypto> {
        self.get_safe_crypto(safe_id)?
            .ok_or(Error::SafeNotFound(safe_id))
    }

    /// Get every key bundle on the device, oldest first
    ///
    /// Rows that fail to decode are logged and skipped so one damaged safe
    /// cannot lock the user out of the others.
    pub fn get_all_safe_crypto(&self) -> Result<Vec<SafeCrypto>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, salt, enc_test, enc_index_key, enc_bubbles_key, enc_item_edition_key,
                    biometric_iv, biometric_enc_key, auto_destruction_key
                 FROM safe_crypto ORDER BY created_at, id",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], safe_crypto_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query safe crypto: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => match record.and_then(checked) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping corrupted safe record: {}", e),
                },
                Err(e) if is_decode_error(&e) => {
                    tracing::warn!("Skipping undecodable safe record: {}", e)
                }
                Err(e) => {
                    return Err(Error::DatabaseError(format!("Failed to read safe crypto: {}", e)))
                }
            }
        }
        Ok(records)
    }

    /// Set or clear the biometric envelope of a safe
    pub fn set_biometric_material(
        &self,
        safe_id: SafeId,
        material: Option<&BiometricCryptoMaterial>,
    ) -> Result<()> {
        if let Some(material) = material {
            material.validate()?;
        }
        let (iv, enc_key) = split_biometric(material);
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE safe_crypto SET biometric_iv = ?, biometric_enc_key = ?, updated_at = ?
                 WHERE id = ?",
                params![iv, enc_key, crate::time::now_timestamp(), safe_id.to_string()],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update biometric material: {}", e)))?;

        if updated == 0 {
            return Err(Error::SafeNotFound(safe_id));
        }
        Ok(())
    }

    /// Set or clear the auto-destruction key of a safe
    pub fn set_auto_destruction_key(&self, safe_id: SafeId, key: Option<&[u8]>) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE safe_crypto SET auto_destruction_key = ?, updated_at = ? WHERE id = ?",
                params![key, crate::time::now_timestamp(), safe_id.to_string()],
            )
            .map_err(|e| {
                Error::DatabaseError(format!("Failed to update auto-destruction key: {}", e))
            })?;

        if updated == 0 {
            return Err(Error::SafeNotFound(safe_id));
        }
        Ok(())
    }

    /// Every safe with an auto-destruction key configured
    pub fn get_auto_destruction_entries(&self) -> Result<Vec<AutoDestructionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, salt, auto_destruction_key FROM safe_crypto
                 WHERE auto_destruction_key IS NOT NULL",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query traps: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, salt, key) = match row {
                Ok(row) => row,
                Err(e) if is_decode_error(&e) => {
                    tracing::warn!("Skipping undecodable trap: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::DatabaseError(format!("Failed to read trap: {}", e))),
            };
            match id.parse() {
                Ok(safe_id) => entries.push(AutoDestructionEntry { safe_id, salt, key }),
                Err(e) => tracing::warn!("Skipping trap with bad safe id {:?}: {}", id, e),
            }
        }
        Ok(entries)
    }

    /// Delete a safe and every row that belongs to it
    ///
    /// Returns whether the safe existed.
    pub fn delete_safe(&self, safe_id: SafeId) -> Result<bool> {
        let id = safe_id.to_string();
        self.with_transaction(|tx| {
            // Child rows cascade; message keys and conversations hang off contacts.
            let deleted = tx
                .execute("DELETE FROM safe_crypto WHERE id = ?", params![id])
                .map_err(|e| Error::DatabaseError(format!("Failed to delete safe: {}", e)))?;
            Ok(deleted > 0)
        })
    }

    // ========================================================================
    // ITEM KEY OPERATIONS
    // ========================================================================

    /// Insert or replace an item key within its safe
    pub fn save_item_key(&self, key: &ItemKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO safe_item_keys (safe_id, id, enc_value) VALUES (?, ?, ?)",
            params![key.safe_id.to_string(), key.id, key.enc_value],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save item key: {}", e)))?;
        Ok(())
    }

    /// Get the item key of `item_id` within a safe
    pub fn get_item_key(&self, safe_id: SafeId, item_id: &str) -> Result<Option<ItemKey>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, safe_id, enc_value FROM safe_item_keys WHERE safe_id = ? AND id = ?",
                params![safe_id.to_string(), item_id],
                item_key_from_row,
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get item key: {}", e)))?;

        result.transpose()
    }

    /// Get every item key of a safe
    pub fn get_all_item_keys(&self, safe_id: SafeId) -> Result<Vec<ItemKey>> {
        let conn = self.conn.lock();
        Self::item_keys_of(&conn, safe_id)
    }

    fn item_keys_of(conn: &Connection, safe_id: SafeId) -> Result<Vec<ItemKey>> {
        let mut stmt = conn
            .prepare("SELECT id, safe_id, enc_value FROM safe_item_keys WHERE safe_id = ? ORDER BY id")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![safe_id.to_string()], item_key_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query item keys: {}", e)))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read item key: {}", e)))??);
        }
        Ok(keys)
    }

    /// Overwrite the encrypted value of existing item keys
    pub fn update_item_keys(conn: &Connection, keys: &[ItemKey]) -> Result<()> {
        let mut stmt = conn
            .prepare("UPDATE safe_item_keys SET enc_value = ? WHERE id = ? AND safe_id = ?")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare update: {}", e)))?;

        for key in keys {
            let updated = stmt
                .execute(params![key.enc_value, key.id, key.safe_id.to_string()])
                .map_err(|e| Error::DatabaseError(format!("Failed to update item key: {}", e)))?;
            if updated == 0 {
                return Err(Error::DatabaseError(format!("Item key {} disappeared", key.id)));
            }
        }
        Ok(())
    }

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    /// Insert or replace an encrypted item payload
    pub fn save_item(&self, safe_id: SafeId, item_id: &str, enc_data: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO safe_items (safe_id, id, enc_data, updated_at) VALUES (?, ?, ?, ?)",
            params![safe_id.to_string(), item_id, enc_data, crate::time::now_timestamp()],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save item: {}", e)))?;
        Ok(())
    }

    /// Get the encrypted payload of `item_id` within a safe
    pub fn get_item(&self, safe_id: SafeId, item_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT enc_data FROM safe_items WHERE safe_id = ? AND id = ?",
            params![safe_id.to_string(), item_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get item: {}", e)))
    }

    /// Number of items stored for a safe
    pub fn count_items(&self, safe_id: SafeId) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM safe_items WHERE safe_id = ?",
            params![safe_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to count items: {}", e)))
    }

    // ========================================================================
    // CONTACT OPERATIONS
    // ========================================================================

    /// Insert or update a contact within its safe
    ///
    /// Updates in place so the conversation and message keys hanging off the
    /// contact survive.
    pub fn save_contact(&self, contact: &ContactRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO contacts (safe_id, id, enc_local_key, enc_shared_key, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (safe_id, id) DO UPDATE SET
                enc_local_key = excluded.enc_local_key,
                enc_shared_key = excluded.enc_shared_key,
                updated_at = excluded.updated_at",
            params![
                contact.safe_id.to_string(),
                contact.id,
                contact.local_key.enc_key,
                contact.shared_key.as_ref().map(|k| k.enc_key.as_slice()),
                crate::time::now_timestamp(),
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save contact: {}", e)))?;
        Ok(())
    }

    /// Get a contact of a safe
    pub fn get_contact(&self, safe_id: SafeId, contact_id: &str) -> Result<Option<ContactRecord>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, safe_id, enc_local_key, enc_shared_key FROM contacts
                 WHERE safe_id = ? AND id = ?",
                params![safe_id.to_string(), contact_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get contact: {}", e)))?;

        result
            .map(|(id, safe_id, local, shared)| {
                Ok(ContactRecord {
                    id,
                    safe_id: safe_id.parse()?,
                    local_key: ContactLocalKey { enc_key: local },
                    shared_key: shared.map(|enc_key| ContactSharedKey { enc_key }),
                })
            })
            .transpose()
    }

    // ========================================================================
    // CONVERSATION OPERATIONS
    // ========================================================================

    /// Insert or replace the encrypted ratchet state of a contact
    pub fn save_conversation(&self, safe_id: SafeId, conversation: &EncConversation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO enc_conversations (safe_id, contact_id, enc_personal_public_key,
                enc_personal_private_key, enc_message_number, enc_sequence_number, enc_root_key,
                enc_sending_chain_key, enc_receive_chain_key, enc_last_contact_public_key,
                enc_received_last_message_number)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                safe_id.to_string(),
                conversation.contact_id,
                conversation.enc_personal_public_key,
                conversation.enc_personal_private_key,
                conversation.enc_message_number,
                conversation.enc_sequence_number,
                conversation.enc_root_key,
                conversation.enc_sending_chain_key,
                conversation.enc_receive_chain_key,
                conversation.enc_last_contact_public_key,
                conversation.enc_received_last_message_number,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save conversation: {}", e)))?;
        Ok(())
    }

    /// Get the encrypted ratchet state of a contact of a safe
    pub fn get_conversation(&self, safe_id: SafeId, contact_id: &str) -> Result<Option<EncConversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT contact_id, enc_personal_public_key, enc_personal_private_key,
                enc_message_number, enc_sequence_number, enc_root_key, enc_sending_chain_key,
                enc_receive_chain_key, enc_last_contact_public_key, enc_received_last_message_number
             FROM enc_conversations WHERE safe_id = ? AND contact_id = ?",
            params![safe_id.to_string(), contact_id],
            |row| {
                Ok(EncConversation {
                    contact_id: row.get(0)?,
                    enc_personal_public_key: row.get(1)?,
                    enc_personal_private_key: row.get(2)?,
                    enc_message_number: row.get(3)?,
                    enc_sequence_number: row.get(4)?,
                    enc_root_key: row.get(5)?,
                    enc_sending_chain_key: row.get(6)?,
                    enc_receive_chain_key: row.get(7)?,
                    enc_last_contact_public_key: row.get(8)?,
                    enc_received_last_message_number: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get conversation: {}", e)))
    }

    // ========================================================================
    // MESSAGE KEY OPERATIONS
    // ========================================================================

    /// Store an encrypted skipped-message key
    pub fn save_message_key(
        &self,
        safe_id: SafeId,
        contact_id: &str,
        message_number: u32,
        enc_key: &[u8],
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO message_keys (safe_id, contact_id, message_number, enc_key)
             VALUES (?, ?, ?, ?)",
            params![safe_id.to_string(), contact_id, message_number, enc_key],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save message key: {}", e)))?;
        Ok(())
    }

    /// Read and delete an encrypted message key
    pub fn take_message_key(
        &self,
        safe_id: SafeId,
        contact_id: &str,
        message_number: u32,
    ) -> Result<Option<Vec<u8>>> {
        let safe_id = safe_id.to_string();
        self.with_transaction(|tx| {
            let enc_key: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT enc_key FROM message_keys
                     WHERE safe_id = ? AND contact_id = ? AND message_number = ?",
                    params![safe_id, contact_id, message_number],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::DatabaseError(format!("Failed to get message key: {}", e)))?;

            if enc_key.is_some() {
                tx.execute(
                    "DELETE FROM message_keys
                     WHERE safe_id = ? AND contact_id = ? AND message_number = ?",
                    params![safe_id, contact_id, message_number],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to delete message key: {}", e)))?;
            }
            Ok(enc_key)
        })
    }

    // ========================================================================
    // SECURE DATASTORE OPERATIONS
    // ========================================================================

    /// Insert or replace a wrapped datastore value
    pub fn datastore_put(&self, name: &str, safe_id: Option<SafeId>, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO secure_datastore (name, safe_id, value) VALUES (?, ?, ?)",
            params![name, safe_id.map(|id| id.to_string()), value],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store datastore value: {}", e)))?;
        Ok(())
    }

    /// Get a wrapped datastore value
    pub fn datastore_get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM secure_datastore WHERE name = ?",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to read datastore value: {}", e)))
    }

    /// Delete a datastore value
    pub fn datastore_delete(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM secure_datastore WHERE name = ?", params![name])
            .map_err(|e| Error::DatabaseError(format!("Failed to delete datastore value: {}", e)))?;
        Ok(deleted > 0)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn split_biometric(material: Option<&BiometricCryptoMaterial>) -> (Option<&[u8]>, Option<&[u8]>) {
    match material {
        Some(m) => (Some(m.iv.as_slice()), Some(m.enc_key.as_slice())),
        None => (None, None),
    }
}

fn is_decode_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..)
    )
}

fn checked(record: SafeCrypto) -> Result<SafeCrypto> {
    record.validate()?;
    Ok(record)
}

fn safe_crypto_from_row(row: &Row<'_>) -> rusqlite::Result<Result<SafeCrypto>> {
    let id: String = row.get(0)?;
    let iv: Option<Vec<u8>> = row.get(6)?;
    let enc_key: Option<Vec<u8>> = row.get(7)?;
    let salt = row.get(1)?;
    let enc_test = row.get(2)?;
    let enc_index_key = row.get(3)?;
    let enc_bubbles_key = row.get(4)?;
    let enc_item_edition_key = row.get(5)?;
    let auto_destruction_key = row.get(8)?;

    Ok(id.parse().map(|id| SafeCrypto {
        id,
        salt,
        enc_test,
        enc_index_key,
        enc_bubbles_key,
        enc_item_edition_key,
        biometric_crypto_material: match (iv, enc_key) {
            (Some(iv), Some(enc_key)) => Some(BiometricCryptoMaterial { iv, enc_key }),
            _ => None,
        },
        auto_destruction_key,
    }))
}

fn item_key_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ItemKey>> {
    let id: String = row.get(0)?;
    let safe_id: String = row.get(1)?;
    let enc_value: Vec<u8> = row.get(2)?;
    Ok(safe_id.parse().map(|safe_id| ItemKey {
        id,
        safe_id,
        enc_value,
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{engine_for, generate_salt, AeadBackend, SymmetricKey};
    use crate::error::ErrorKind;
    use crate::safe::{ENC_KEY_SIZE, MASTER_KEY_TEST_VALUE};

    fn record() -> SafeCrypto {
        let engine = engine_for(AeadBackend::RustCrypto);
        let master = SymmetricKey::generate();
        let seal = || engine.encrypt(&[1u8; 32], master.as_bytes(), None).unwrap();
        SafeCrypto {
            id: SafeId::new(),
            salt: generate_salt(32),
            enc_test: engine
                .encrypt(MASTER_KEY_TEST_VALUE.as_bytes(), master.as_bytes(), None)
                .unwrap(),
            enc_index_key: seal(),
            enc_bubbles_key: seal(),
            enc_item_edition_key: seal(),
            biometric_crypto_material: None,
            auto_destruction_key: None,
        }
    }

    fn item_key(safe_id: SafeId, id: &str) -> ItemKey {
        ItemKey {
            id: id.to_string(),
            safe_id,
            enc_value: vec![7u8; ENC_KEY_SIZE],
        }
    }

    #[tokio::test]
    async fn test_database_creation() {
        let db = Database::open(None).await.unwrap();
        assert!(db.get_all_safe_crypto().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_safe_crypto_operations() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();

        let loaded = db.get_safe_crypto(record.id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(db.get_all_safe_crypto().unwrap().len(), 1);
        assert!(db.get_safe_crypto(SafeId::new()).unwrap().is_none());
        assert_eq!(
            db.require_safe_crypto(SafeId::new()).unwrap_err().kind(),
            ErrorKind::Storage
        );
    }

    #[tokio::test]
    async fn test_biometric_and_trap_columns() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();

        let material = BiometricCryptoMaterial {
            iv: vec![1; 16],
            enc_key: vec![2; 48],
        };
        db.set_biometric_material(record.id, Some(&material)).unwrap();
        db.set_auto_destruction_key(record.id, Some(b"abcd")).unwrap();

        let loaded = db.get_safe_crypto(record.id).unwrap().unwrap();
        assert_eq!(loaded.biometric_crypto_material, Some(material));
        assert_eq!(loaded.auto_destruction_key.as_deref(), Some(&b"abcd"[..]));

        let entries = db.get_auto_destruction_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].safe_id, record.id);

        db.set_biometric_material(record.id, None).unwrap();
        db.set_auto_destruction_key(record.id, None).unwrap();
        let loaded = db.get_safe_crypto(record.id).unwrap().unwrap();
        assert!(loaded.biometric_crypto_material.is_none());
        assert!(db.get_auto_destruction_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_row_is_corrupted_vault() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();
        db.execute_batch(&format!(
            "UPDATE safe_crypto SET enc_index_key = X'00' WHERE id = '{}'",
            record.id
        ))
        .unwrap();

        let err = db.get_safe_crypto(record.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedVault);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();
        db.save_item_key(&item_key(record.id, "item-1")).unwrap();

        let result: Result<()> = db.with_transaction(|tx| {
            let mut changed = item_key(record.id, "item-1");
            changed.enc_value = vec![9u8; ENC_KEY_SIZE];
            Database::update_item_keys(tx, &[changed])?;
            Err(Error::Internal("simulated failure".into()))
        });
        assert!(result.is_err());

        let stored = db.get_item_key(record.id, "item-1").unwrap().unwrap();
        assert_eq!(stored.enc_value, vec![7u8; ENC_KEY_SIZE]);
    }

    #[tokio::test]
    async fn test_update_missing_item_key_fails() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();

        let result = db.with_transaction(|tx| {
            Database::update_item_keys(tx, &[item_key(record.id, "ghost")])
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_safe_cascades() {
        let db = Database::open(None).await.unwrap();
        let keep = record();
        let doomed = record();
        db.insert_safe_crypto(&keep).unwrap();
        db.insert_safe_crypto(&doomed).unwrap();

        db.save_item_key(&item_key(doomed.id, "doomed-item")).unwrap();
        db.save_item(doomed.id, "doomed-item", b"ciphertext").unwrap();
        db.save_item_key(&item_key(keep.id, "kept-item")).unwrap();
        db.save_contact(&ContactRecord {
            id: "contact-1".into(),
            safe_id: doomed.id,
            local_key: ContactLocalKey { enc_key: vec![1; 60] },
            shared_key: None,
        })
        .unwrap();
        db.save_message_key(doomed.id, "contact-1", 3, b"enc").unwrap();
        db.datastore_put("queue", Some(doomed.id), b"wrapped").unwrap();

        assert!(db.delete_safe(doomed.id).unwrap());
        assert!(!db.delete_safe(doomed.id).unwrap());

        assert!(db.get_safe_crypto(doomed.id).unwrap().is_none());
        assert!(db.get_all_item_keys(doomed.id).unwrap().is_empty());
        assert_eq!(db.count_items(doomed.id).unwrap(), 0);
        assert!(db.get_contact(doomed.id, "contact-1").unwrap().is_none());
        assert!(db.take_message_key(doomed.id, "contact-1", 3).unwrap().is_none());
        assert!(db.datastore_get("queue").unwrap().is_none());
        assert_eq!(db.get_all_item_keys(keep.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_take_message_key_consumes() {
        let db = Database::open(None).await.unwrap();
        let record = record();
        db.insert_safe_crypto(&record).unwrap();
        db.save_contact(&ContactRecord {
            id: "bob".into(),
            safe_id: record.id,
            local_key: ContactLocalKey { enc_key: vec![1; 60] },
            shared_key: Some(ContactSharedKey { enc_key: vec![2; 60] }),
        })
        .unwrap();

        db.save_message_key(record.id, "bob", 1, b"k1").unwrap();
        assert_eq!(
            db.take_message_key(record.id, "bob", 1).unwrap().as_deref(),
            Some(&b"k1"[..])
        );
        assert!(db.take_message_key(record.id, "bob", 1).unwrap().is_none());

        let contact = db.get_contact(record.id, "bob").unwrap().unwrap();
        assert_eq!(contact.shared_key.unwrap().enc_key, vec![2; 60]);
    }

    #[tokio::test]
    async fn test_same_item_id_in_two_safes() {
        let db = Database::open(None).await.unwrap();
        let alpha = record();
        let bravo = record();
        db.insert_safe_crypto(&alpha).unwrap();
        db.insert_safe_crypto(&bravo).unwrap();

        db.save_item_key(&item_key(alpha.id, "note")).unwrap();
        db.save_item(alpha.id, "note", b"alpha data").unwrap();
        let mut other = item_key(bravo.id, "note");
        other.enc_value = vec![8u8; ENC_KEY_SIZE];
        db.save_item_key(&other).unwrap();
        db.save_item(bravo.id, "note", b"bravo data").unwrap();

        let key = db.get_item_key(alpha.id, "note").unwrap().unwrap();
        assert_eq!(key.safe_id, alpha.id);
        assert_eq!(key.enc_value, vec![7u8; ENC_KEY_SIZE]);
        assert_eq!(db.get_item(alpha.id, "note").unwrap().as_deref(), Some(&b"alpha data"[..]));
        assert_eq!(db.get_item(bravo.id, "note").unwrap().as_deref(), Some(&b"bravo data"[..]));

        assert!(db.delete_safe(bravo.id).unwrap());
        assert!(db.get_item_key(alpha.id, "note").unwrap().is_some());
        assert_eq!(db.count_items(alpha.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contact_update_keeps_message_keys() {
        let db = Database::open(None).await.unwrap();
        let alpha = record();
        let bravo = record();
        db.insert_safe_crypto(&alpha).unwrap();
        db.insert_safe_crypto(&bravo).unwrap();
        let contact = |safe_id: SafeId, byte: u8| ContactRecord {
            id: "bob".into(),
            safe_id,
            local_key: ContactLocalKey { enc_key: vec![byte; 60] },
            shared_key: None,
        };

        db.save_contact(&contact(alpha.id, 1)).unwrap();
        db.save_message_key(alpha.id, "bob", 4, b"k4").unwrap();
        db.save_contact(&contact(bravo.id, 2)).unwrap();

        let mut updated = contact(alpha.id, 1);
        updated.shared_key = Some(ContactSharedKey { enc_key: vec![3; 60] });
        db.save_contact(&updated).unwrap();

        assert!(db.get_contact(alpha.id, "bob").unwrap().unwrap().shared_key.is_some());
        assert_eq!(
            db.get_contact(bravo.id, "bob").unwrap().unwrap().local_key.enc_key,
            vec![2; 60]
        );
        assert!(db.take_message_key(alpha.id, "bob", 4).unwrap().is_some());
        assert!(db.take_message_key(bravo.id, "bob", 4).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_skipped_by_scans() {
        let db = Database::open(None).await.unwrap();
        let broken = record();
        let healthy = record();
        db.insert_safe_crypto(&broken).unwrap();
        db.insert_safe_crypto(&healthy).unwrap();
        db.set_auto_destruction_key(healthy.id, Some(b"trap")).unwrap();
        db.execute_batch(&format!(
            "UPDATE safe_crypto SET salt = X'0011' WHERE id = '{}'",
            broken.id
        ))
        .unwrap();

        let all = db.get_all_safe_crypto().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, healthy.id);
        assert_eq!(db.get_safe_crypto(broken.id).unwrap_err().kind(), ErrorKind::CorruptedVault);

        db.execute_batch(&format!(
            "UPDATE safe_crypto SET salt = 'text' WHERE id = '{}'",
            broken.id
        ))
        .unwrap();
        assert_eq!(db.get_all_safe_crypto().unwrap().len(), 1);
        assert_eq!(db.get_auto_destruction_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safes.db");
        let path = path.to_str().unwrap();
        let record = record();

        {
            let db = Database::open(Some(path)).await.unwrap();
            db.insert_safe_crypto(&record).unwrap();
        }

        let db = Database::open(Some(path)).await.unwrap();
        assert_eq!(db.get_safe_crypto(record.id).unwrap().unwrap(), record);
    }
}
