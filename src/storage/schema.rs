//! # Database Schema
//!
//! SQL schema definitions for the safe database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────┐    ┌─────────────────┐   ┌─────────────────┐  │
//! │  │     safe_crypto      │    │ safe_item_keys  │   │   safe_items    │  │
//! │  ├──────────────────────┤    ├─────────────────┤   ├─────────────────┤  │
//! │  │ id                   │◄───│ safe_id  (pk)   │   │ safe_id  (pk)   │──┤
//! │  │ salt                 │    │ id       (pk)   │   │ id       (pk)   │  │
//! │  │ enc_test             │    │ enc_value       │   │ enc_data        │  │
//! │  │ enc_index_key        │    └─────────────────┘   └─────────────────┘  │
//! │  │ enc_bubbles_key      │                                               │
//! │  │ enc_item_edition_key │    ┌─────────────────┐   ┌─────────────────┐  │
//! │  │ biometric_iv         │    │    contacts     │   │enc_conversations│  │
//! │  │ biometric_enc_key    │◄───│ safe_id  (pk)   │◄──│ safe_id  (pk)   │  │
//! │  │ auto_destruction_key │    │ id       (pk)   │   │ contact_id (pk) │  │
//! │  └──────────────────────┘    │ enc_local_key   │   │ enc_* fields    │  │
//! │                              │ enc_shared_key  │   └─────────────────┘  │
//! │  ┌──────────────────────┐    └─────────────────┘◄──┌─────────────────┐  │
//! │  │   secure_datastore   │                          │  message_keys   │  │
//! │  │ name, safe_id, value │                          │ safe_id  (pk)   │  │
//! │  └──────────────────────┘                          │ contact_id (pk) │  │
//! │                                                    │ message_number  │  │
//! │                                                    │ enc_key         │  │
//! │                                                    └─────────────────┘  │
//! │                                                                         │
//! │  Item and contact ids are unique per safe only. Every child table      │
//! │  cascades on safe deletion.                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Per-connection settings
pub const CONNECTION_PRAGMAS: &str = r#"
PRAGMA foreign_keys = ON;
"#;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- One key bundle per safe
CREATE TABLE IF NOT EXISTS safe_crypto (
    -- SafeId (UUID string)
    id TEXT PRIMARY KEY,
    -- PBKDF2 salt, fixed between password changes
    salt BLOB NOT NULL,
    -- Known marker under the master key
    enc_test BLOB NOT NULL,
    -- Working keys, each under the master key
    enc_index_key BLOB NOT NULL,
    enc_bubbles_key BLOB NOT NULL,
    enc_item_edition_key BLOB NOT NULL,
    -- Biometric envelope, both NULL or both set
    biometric_iv BLOB,
    biometric_enc_key BLOB,
    -- hex(SHA-256(salt || decoy password)) as UTF-8 bytes
    auto_destruction_key BLOB,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((biometric_iv IS NULL) = (biometric_enc_key IS NULL))
);

-- Item keys, each under the master key of its safe; item ids are only
-- unique within a safe
CREATE TABLE IF NOT EXISTS safe_item_keys (
    safe_id TEXT NOT NULL REFERENCES safe_crypto(id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    enc_value BLOB NOT NULL,
    PRIMARY KEY (safe_id, id)
);

-- Encrypted item payloads, keyed like their item key
CREATE TABLE IF NOT EXISTS safe_items (
    safe_id TEXT NOT NULL REFERENCES safe_crypto(id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    enc_data BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (safe_id, id)
);

-- Bubbles contacts; the same contact may appear in several safes
CREATE TABLE IF NOT EXISTS contacts (
    safe_id TEXT NOT NULL REFERENCES safe_crypto(id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    -- Contact local key under the bubbles key
    enc_local_key BLOB NOT NULL,
    -- Ratchet shared key under the local key, once the handshake is done
    enc_shared_key BLOB,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (safe_id, id)
);

-- Ratchet state, every field under the contact local key
CREATE TABLE IF NOT EXISTS enc_conversations (
    safe_id TEXT NOT NULL,
    contact_id TEXT NOT NULL,
    enc_personal_public_key BLOB NOT NULL,
    enc_personal_private_key BLOB NOT NULL,
    enc_message_number BLOB NOT NULL,
    enc_sequence_number BLOB NOT NULL,
    enc_root_key BLOB,
    enc_sending_chain_key BLOB,
    enc_receive_chain_key BLOB,
    enc_last_contact_public_key BLOB,
    enc_received_last_message_number BLOB,
    PRIMARY KEY (safe_id, contact_id),
    FOREIGN KEY (safe_id, contact_id) REFERENCES contacts(safe_id, id) ON DELETE CASCADE
);

-- Skipped-message keys, under the contact local key
CREATE TABLE IF NOT EXISTS message_keys (
    safe_id TEXT NOT NULL,
    contact_id TEXT NOT NULL,
    message_number INTEGER NOT NULL,
    enc_key BLOB NOT NULL,
    PRIMARY KEY (safe_id, contact_id, message_number),
    FOREIGN KEY (safe_id, contact_id) REFERENCES contacts(safe_id, id) ON DELETE CASCADE
);

-- Values wrapped by secure key storage (iv || wrapped)
CREATE TABLE IF NOT EXISTS secure_datastore (
    name TEXT PRIMARY KEY,
    safe_id TEXT REFERENCES safe_crypto(id) ON DELETE CASCADE,
    value BLOB NOT NULL
);
"#;
