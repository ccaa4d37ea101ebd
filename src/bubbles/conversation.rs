//! Ratchet conversation state, field-encrypted under the contact local key.
//!
//! Counters are stored as 4-byte big-endian integers before encryption.

use zeroize::Zeroizing;

use super::BubblesCryptoRepository;
use crate::error::{Error, Result};

/// Plain ratchet state of one conversation
#[derive(Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Contact the conversation belongs to
    pub contact_id: String,
    /// Our ratchet public key
    pub personal_public_key: Vec<u8>,
    /// Our ratchet private key
    pub personal_private_key: Zeroizing<Vec<u8>>,
    /// Number of the next message we send
    pub message_number: u32,
    /// Length of the previous sending chain
    pub sequence_number: u32,
    /// Root key, once the handshake completed
    pub root_key: Option<Zeroizing<Vec<u8>>>,
    /// Sending chain key
    pub sending_chain_key: Option<Zeroizing<Vec<u8>>>,
    /// Receiving chain key
    pub receive_chain_key: Option<Zeroizing<Vec<u8>>>,
    /// Last ratchet public key seen from the contact
    pub last_contact_public_key: Option<Vec<u8>>,
    /// Number of the last message received
    pub received_last_message_number: Option<u32>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("contact_id", &self.contact_id)
            .field("message_number", &self.message_number)
            .field("sequence_number", &self.sequence_number)
            .field("received_last_message_number", &self.received_last_message_number)
            .finish_non_exhaustive()
    }
}

/// Persisted form of a [`Conversation`]
///
/// Every `enc_*` field is the matching plain field under the contact
/// local key.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncConversation {
    /// Contact the conversation belongs to
    pub contact_id: String,
    pub enc_personal_public_key: Vec<u8>,
    pub enc_personal_private_key: Vec<u8>,
    pub enc_message_number: Vec<u8>,
    pub enc_sequence_number: Vec<u8>,
    pub enc_root_key: Option<Vec<u8>>,
    pub enc_sending_chain_key: Option<Vec<u8>>,
    pub enc_receive_chain_key: Option<Vec<u8>>,
    pub enc_last_contact_public_key: Option<Vec<u8>>,
    pub enc_received_last_message_number: Option<Vec<u8>>,
}

fn decode_counter(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::CorruptedVault(format!("conversation counter is {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}

impl BubblesCryptoRepository {
    /// Encrypt every field of `conversation` under its contact local key
    pub async fn encrypt_conversation(&self, conversation: &Conversation) -> Result<EncConversation> {
        let contact = self.get_contact(&conversation.contact_id)?;
        let message_number = conversation.message_number.to_be_bytes();
        let sequence_number = conversation.sequence_number.to_be_bytes();
        let received = conversation.received_last_message_number.map(u32::to_be_bytes);

        let fields = [
            Some(conversation.personal_public_key.as_slice()),
            Some(conversation.personal_private_key.as_slice()),
            Some(message_number.as_slice()),
            Some(sequence_number.as_slice()),
            conversation.root_key.as_deref().map(Vec::as_slice),
            conversation.sending_chain_key.as_deref().map(Vec::as_slice),
            conversation.receive_chain_key.as_deref().map(Vec::as_slice),
            conversation.last_contact_public_key.as_deref(),
            received.as_ref().map(|r| r.as_slice()),
        ];
        let [public_key, private_key, message_number, sequence_number, root_key, sending, receive, last_contact, received]: [Option<Vec<u8>>; 9] = self
            .local_encrypt_all(&contact.local_key, &fields)
            .await?
            .try_into()
            .map_err(|_| Error::Internal("conversation field count changed".into()))?;
        let missing = || Error::Internal("conversation field was not encrypted".into());

        Ok(EncConversation {
            contact_id: conversation.contact_id.clone(),
            enc_personal_public_key: public_key.ok_or_else(missing)?,
            enc_personal_private_key: private_key.ok_or_else(missing)?,
            enc_message_number: message_number.ok_or_else(missing)?,
            enc_sequence_number: sequence_number.ok_or_else(missing)?,
            enc_root_key: root_key,
            enc_sending_chain_key: sending,
            enc_receive_chain_key: receive,
            enc_last_contact_public_key: last_contact,
            enc_received_last_message_number: received,
        })
    }

    /// Decrypt a persisted conversation
    pub async fn decrypt_conversation(&self, enc: &EncConversation) -> Result<Conversation> {
        let contact = self.get_contact(&enc.contact_id)?;
        let fields = [
            Some(enc.enc_personal_public_key.as_slice()),
            Some(enc.enc_personal_private_key.as_slice()),
            Some(enc.enc_message_number.as_slice()),
            Some(enc.enc_sequence_number.as_slice()),
            enc.enc_root_key.as_deref(),
            enc.enc_sending_chain_key.as_deref(),
            enc.enc_receive_chain_key.as_deref(),
            enc.enc_last_contact_public_key.as_deref(),
            enc.enc_received_last_message_number.as_deref(),
        ];
        let [public_key, private_key, message_number, sequence_number, root_key, sending, receive, last_contact, received]: [Option<Zeroizing<Vec<u8>>>; 9] = self
            .local_decrypt_all(&contact.local_key, &fields)
            .await?
            .try_into()
            .map_err(|_| Error::Internal("conversation field count changed".into()))?;
        let missing = || Error::CorruptedVault(format!("conversation {} is missing a field", enc.contact_id));

        Ok(Conversation {
            contact_id: enc.contact_id.clone(),
            personal_public_key: public_key.ok_or_else(missing)?.to_vec(),
            personal_private_key: private_key.ok_or_else(missing)?,
            message_number: decode_counter(&message_number.ok_or_else(missing)?)?,
            sequence_number: decode_counter(&sequence_number.ok_or_else(missing)?)?,
            root_key,
            sending_chain_key: sending,
            receive_chain_key: receive,
            last_contact_public_key: last_contact.map(|k| k.to_vec()),
            received_last_message_number: received.map(|n| decode_counter(&n)).transpose()?,
        })
    }

    /// Encrypt and persist a conversation
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let contact = self.get_contact(&conversation.contact_id)?;
        let enc = self.encrypt_conversation(conversation).await?;
        self.database().save_conversation(contact.safe_id, &enc)
    }

    /// Load and decrypt the conversation with a contact
    pub async fn load_conversation(&self, contact_id: &str) -> Result<Option<Conversation>> {
        let contact = self.get_contact(contact_id)?;
        match self.database().get_conversation(contact.safe_id, contact_id)? {
            Some(enc) => Ok(Some(self.decrypt_conversation(&enc).await?)),
            None => Ok(None),
        }
    }
}
