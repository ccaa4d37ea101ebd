//! In-memory key slot.
//!
//! A slot is `Empty` or `Holding` the key of exactly one safe. Loading into
//! a holding slot is an error rather than a silent overwrite; the only
//! in-place swap is [`KeySlot::replace_after_commit`], used once a password
//! change has been committed. Keys are zeroized when they leave the slot.

use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::safe::SafeId;

enum SlotState {
    Empty,
    Holding { safe_id: SafeId, key: SymmetricKey },
}

/// Single-owner holder for one decrypted key
pub struct KeySlot {
    name: &'static str,
    state: SlotState,
}

impl KeySlot {
    /// Create an empty slot; `name` is used in error messages
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: SlotState::Empty,
        }
    }

    /// Safe whose key is held, if any
    pub fn holder(&self) -> Option<SafeId> {
        match &self.state {
            SlotState::Empty => None,
            SlotState::Holding { safe_id, .. } => Some(*safe_id),
        }
    }

    /// Check whether the slot is empty
    pub fn is_empty(&self) -> bool {
        matches!(self.state, SlotState::Empty)
    }

    /// Put a key into an empty slot
    pub fn load(&mut self, safe_id: SafeId, key: SymmetricKey) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::KeyAlreadyLoaded(self.name));
        }
        self.state = SlotState::Holding { safe_id, key };
        Ok(())
    }

    /// Run `f` with the held key
    pub fn with_key<T>(&self, f: impl FnOnce(SafeId, &SymmetricKey) -> T) -> Result<T> {
        match &self.state {
            SlotState::Empty => Err(Error::KeyNotLoaded(self.name)),
            SlotState::Holding { safe_id, key } => Ok(f(*safe_id, key)),
        }
    }

    /// Run `f` with the held key, requiring that it belongs to `expected`
    pub fn with_key_for<T>(
        &self,
        expected: SafeId,
        f: impl FnOnce(&SymmetricKey) -> T,
    ) -> Result<T> {
        match &self.state {
            SlotState::Empty => Err(Error::KeyNotLoaded(self.name)),
            SlotState::Holding { safe_id, key } if *safe_id == expected => Ok(f(key)),
            SlotState::Holding { .. } => Err(Error::SafeMismatch(self.name)),
        }
    }

    /// Swap the held key for a rotated one of the same safe
    pub fn replace_after_commit(&mut self, safe_id: SafeId, key: SymmetricKey) -> Result<()> {
        match &self.state {
            SlotState::Holding { safe_id: held, .. } if *held == safe_id => {
                // Old key is zeroized on drop.
                self.state = SlotState::Holding { safe_id, key };
                Ok(())
            }
            SlotState::Holding { .. } => Err(Error::SafeMismatch(self.name)),
            SlotState::Empty => Err(Error::KeyNotLoaded(self.name)),
        }
    }

    /// Drop the held key
    pub fn clear(&mut self) {
        if let SlotState::Holding { key, .. } = &mut self.state {
            zeroize::Zeroize::zeroize(key);
        }
        self.state = SlotState::Empty;
    }
}

impl std::fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySlot")
            .field("name", &self.name)
            .field("holder", &self.holder())
            .finish()
    }
}
