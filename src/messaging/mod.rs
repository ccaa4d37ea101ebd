//! # Messaging Module
//!
//! Payload encryption with one-time message keys handed out by a ratchet
//! session.
//!
//! ## Message Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ENCRYPTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender                                                                │
//! │  ─────────────────────────────────────────────────────────────         │
//! │                                                                         │
//! │  1. Ask the ratchet for the session state                              │
//! │        Corrupted ──► ConversationCorrupted                             │
//! │                                                                         │
//! │  2. Take the next sending key                                          │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  (message_number, message_key) = ratchet.sending_key()     │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  3. Encrypt                                                            │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  ChaCha20-Poly1305(message_key, random nonce, payload)     │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Output: SealedMessage { message_number, ciphertext }                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Receiving
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE DECRYPTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. Skipped key stored for (contact, message_number)?                  │
//! │        yes ──► pop it (read + delete)                                  │
//! │        no  ──► ratchet.receiving_key(contact, message_number)          │
//! │                                                                         │
//! │  2. Decrypt; a tag mismatch is a BadContactKey                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ratchet state machine lives outside this crate. It derives and
//! discards message keys; this module only applies them.

use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::bubbles::BubblesCryptoRepository;
use crate::crypto::{AeadEngine, SymmetricKey};
use crate::error::{Error, Result};

/// Health of a ratchet session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Keys can be derived
    Established,
    /// The session lost sync and must be re-established
    Corrupted,
}

/// One-time key for a single message
#[derive(Debug)]
pub struct MessageKey {
    /// Position of the message in the sending chain
    pub message_number: u32,
    /// Key material
    pub key: SymmetricKey,
}

/// Ciphertext and the number needed to find its key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Position of the message in the sending chain
    pub message_number: u32,
    /// nonce || ciphertext || tag
    pub ciphertext: Vec<u8>,
}

/// Double-ratchet session provided by the host
#[async_trait]
pub trait RatchetSessionProvider: Send + Sync {
    /// Current state of the session with `contact_id`
    async fn session_state(&self, contact_id: &str) -> Result<SessionState>;

    /// Advance the sending chain and return its key
    async fn sending_key(&self, contact_id: &str) -> Result<MessageKey>;

    /// Key for an incoming message, or `None` if the chain cannot reach it
    ///
    /// Keys of messages skipped on the way are handed to
    /// [`MessagingCryptoRepository::save_message_key`] by the provider.
    async fn receiving_key(&self, contact_id: &str, message_number: u32) -> Result<Option<SymmetricKey>>;
}

/// Message encryption for one safe's contacts
pub struct MessagingCryptoRepository {
    bubbles: Arc<BubblesCryptoRepository>,
    engine: Arc<dyn AeadEngine>,
    sessions: Arc<dyn RatchetSessionProvider>,
}

impl MessagingCryptoRepository {
    /// Create a repository over a ratchet provider
    pub fn new(
        bubbles: Arc<BubblesCryptoRepository>,
        engine: Arc<dyn AeadEngine>,
        sessions: Arc<dyn RatchetSessionProvider>,
    ) -> Self {
        Self {
            bubbles,
            engine,
            sessions,
        }
    }

    // ========================================================================
    // RAW MESSAGE KEYS
    // ========================================================================

    /// Encrypt `data` with a message key
    pub fn encrypt_message(&self, data: &[u8], message_key: &SymmetricKey) -> Result<Vec<u8>> {
        self.engine.encrypt(data, message_key.as_bytes(), None)
    }

    /// Decrypt `data` with a message key
    pub fn decrypt_message(&self, data: &[u8], message_key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
        self.engine
            .decrypt(data, message_key.as_bytes(), None)
            .map_err(|e| match e {
                Error::CryptoAuthFailure(_) => {
                    Error::BadContactKey("message does not open with its message key".into())
                }
                other => other,
            })
    }

    // ========================================================================
    // SESSION-DRIVEN
    // ========================================================================

    /// Encrypt `data` for `contact_id` with the next sending key
    pub async fn encrypt_for_contact(&self, contact_id: &str, data: &[u8]) -> Result<SealedMessage> {
        self.ensure_established(contact_id).await?;
        let message_key = self.sessions.sending_key(contact_id).await?;
        let ciphertext = self.encrypt_message(data, &message_key.key)?;

        #[cfg(feature = "verbose-logging")]
        tracing::debug!("Sealed message {} for {}", message_key.message_number, contact_id);

        Ok(SealedMessage {
            message_number: message_key.message_number,
            ciphertext,
        })
    }

    /// Decrypt a message received from `contact_id`
    ///
    /// Stored skipped keys are consumed before asking the ratchet.
    pub async fn decrypt_from_contact(
        &self,
        contact_id: &str,
        message: &SealedMessage,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_established(contact_id).await?;

        let key = match self.pop_message_key(contact_id, message.message_number).await {
            Ok(key) => key,
            Err(Error::MessageKeyNotFound(_)) => self
                .sessions
                .receiving_key(contact_id, message.message_number)
                .await?
                .ok_or_else(|| message_key_not_found(contact_id, message.message_number))?,
            Err(e) => return Err(e),
        };
        self.decrypt_message(&message.ciphertext, &key)
    }

    async fn ensure_established(&self, contact_id: &str) -> Result<()> {
        match self.sessions.session_state(contact_id).await? {
            SessionState::Established => Ok(()),
            SessionState::Corrupted => {
                tracing::warn!("Ratchet session with {} is corrupted", contact_id);
                Err(Error::ConversationCorrupted(contact_id.to_string()))
            }
        }
    }

    // ========================================================================
    // SKIPPED MESSAGE KEYS
    // ========================================================================

    /// Store the key of a message that has not arrived yet
    pub async fn save_message_key(
        &self,
        contact_id: &str,
        message_number: u32,
        key: &SymmetricKey,
    ) -> Result<()> {
        let contact = self.bubbles.get_contact(contact_id)?;
        let enc = self.bubbles.local_encrypt(&contact.local_key, key.as_bytes()).await?;
        self.bubbles
            .database()
            .save_message_key(contact.safe_id, contact_id, message_number, &enc)
    }

    /// Read and delete a stored message key
    pub async fn pop_message_key(&self, contact_id: &str, message_number: u32) -> Result<SymmetricKey> {
        let contact = self.bubbles.get_contact(contact_id)?;
        let enc = self
            .bubbles
            .database()
            .take_message_key(contact.safe_id, contact_id, message_number)?
            .ok_or_else(|| message_key_not_found(contact_id, message_number))?;

        let raw = self.bubbles.local_decrypt(&contact.local_key, &enc).await?;
        SymmetricKey::from_slice(&raw)
            .map_err(|_| Error::CorruptedVault(format!("message key {} has bad length", message_number)))
    }
}

fn message_key_not_found(contact_id: &str, message_number: u32) -> Error {
    Error::MessageKeyNotFound(format!("{}#{}", contact_id, message_number))
}

// ============================================================================
// TESTS
// ============================================================================
