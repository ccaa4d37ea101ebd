//! # Storage Module
//!
//! Persistence for key bundles and the platform key storage seam.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Secure Key Storage (Keys Only)                                 │   │
//! │  │  ──────────────────────────────                                  │   │
//! │  │                                                                 │   │
//! │  │  Platform keystore behind the SecureKeyStorage trait           │   │
//! │  │  SoftwareKeyStorage for tests and non-platform builds          │   │
//! │  │                                                                 │   │
//! │  │  Holds: biometric wrapping keys, datastore key                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite Database                                                │   │
//! │  │  ───────────────                                                 │   │
//! │  │                                                                 │   │
//! │  │  Tables:                                                       │   │
//! │  │  • safe_crypto - One key bundle per safe                       │   │
//! │  │  • safe_item_keys - Item keys under the master key             │   │
//! │  │  • safe_items - Encrypted item payloads                        │   │
//! │  │  • contacts / enc_conversations / message_keys - Bubbles       │   │
//! │  │  • secure_datastore - Values wrapped by key storage            │   │
//! │  │                                                                 │   │
//! │  │  Every value that matters is ciphertext before it gets here.  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod schema;
mod secure_store;

pub use database::{AutoDestructionEntry, Database};
pub use secure_store::{
    aliases, generate_wrap_iv, KeyAccess, KeyStorageError, SecureDataStore, SecureKeyStorage,
    SoftwareKeyStorage, WRAP_IV_SIZE,
};

use crate::error::Result;

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Path to the database file (None for in-memory)
    pub database_path: Option<String>,
}

/// Initialize the storage system
pub async fn init(config: StorageConfig) -> Result<Database> {
    Database::open(config.database_path.as_deref()).await
}
