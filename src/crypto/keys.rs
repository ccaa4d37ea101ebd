//! # Key Material
//!
//! Owned containers for symmetric keys and passwords.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Password        User input, scrubbed when the last owner drops it    │
//! │                                                                         │
//! │  SymmetricKey    32 random or derived bytes, zeroized on drop          │
//! │    ├── master key       (derived from password + salt, never stored)  │
//! │    ├── index key        (stored as encIndexKey)                       │
//! │    ├── bubbles key      (stored as encBubblesKey)                     │
//! │    ├── item-edition key (stored as encItemEditionKey)                 │
//! │    └── item keys        (one per item, stored under the master key)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// Size of every symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A 256-bit symmetric key
///
/// The bytes are zeroized when the key is dropped. `Debug` never prints
/// the key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a new random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, rejecting anything that is not exactly
    /// [`KEY_SIZE`] bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &SymmetricKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A user password
///
/// The buffer is overwritten with zeros on drop. Operations that need the
/// password across an `.await` share it behind an `Arc` so no second copy
/// is made.
pub struct Password(Zeroizing<String>);

impl Password {
    /// Wrap a password string
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    /// UTF-8 bytes of the password
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Check whether the password is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert!(!a.ct_eq(&b));
        assert!(a.ct_eq(&a.clone()));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(SymmetricKey::from_slice(&[0u8; 31]).is_err());
        assert!(SymmetricKey::from_slice(&[0u8; 33]).is_err());
        let key = SymmetricKey::from_slice(&[7u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_SIZE]);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SymmetricKey(..)");

        let password = Password::from("correct-horse");
        assert!(!format!("{:?}", password).contains("horse"));
    }
}
