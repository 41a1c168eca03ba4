//! Identity key mismatches attached to message records

use serde::{Deserialize, Serialize};

use crate::crypto::keys::IdentityKey;
use crate::identity::record::RecipientId;
use crate::messaging::record::{MessageId, ThreadId};

/// A message observed an identity key that differs from the trusted one.
///
/// Two mismatches are equivalent when they name the same recipient and the
/// same candidate key; where they were observed doesn't matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyMismatch {
    pub recipient_id: RecipientId,
    pub identity_key: IdentityKey,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
}

impl IdentityKeyMismatch {
    pub fn new(
        recipient_id: RecipientId,
        identity_key: IdentityKey,
        message_id: MessageId,
        thread_id: ThreadId,
    ) -> Self {
        Self {
            recipient_id,
            identity_key,
            message_id,
            thread_id,
        }
    }

    /// Equivalence class of this mismatch
    pub fn key(&self) -> MismatchKey {
        MismatchKey {
            recipient_id: self.recipient_id,
            identity_key: self.identity_key,
        }
    }

    pub fn is_equivalent(&self, other: &IdentityKeyMismatch) -> bool {
        self.key() == other.key()
    }
}

/// (recipient, candidate key) identity shared by equivalent mismatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MismatchKey {
    pub recipient_id: RecipientId,
    pub identity_key: IdentityKey,
}

impl MismatchKey {
    pub fn matches(&self, mismatch: &IdentityKeyMismatch) -> bool {
        mismatch.recipient_id == self.recipient_id && mismatch.identity_key == self.identity_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalence_ignores_origin() {
        let key = IdentityKey::from_public_bytes([3u8; 32]);
        let a = IdentityKeyMismatch::new(7, key, 100, 1);
        let b = IdentityKeyMismatch::new(7, key, 200, 2);

        assert!(a.is_equivalent(&b));
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_different_key_not_equivalent() {
        let a = IdentityKeyMismatch::new(7, IdentityKey::from_public_bytes([3u8; 32]), 100, 1);
        let b = IdentityKeyMismatch::new(7, IdentityKey::from_public_bytes([4u8; 32]), 100, 1);
        assert!(!a.is_equivalent(&b));
        assert!(!a.key().matches(&b));
    }

    #[test]
    fn test_different_recipient_not_equivalent() {
        let key = IdentityKey::from_public_bytes([3u8; 32]);
        let a = IdentityKeyMismatch::new(7, key, 100, 1);
        let b = IdentityKeyMismatch::new(8, key, 100, 1);
        assert!(!a.is_equivalent(&b));
    }
}
