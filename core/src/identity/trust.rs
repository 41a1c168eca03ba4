//! Trust evaluation for candidate identity keys

use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto::keys::IdentityKey;
use crate::identity::mismatch::IdentityKeyMismatch;
use crate::identity::record::RecipientId;
use crate::identity::store::IdentityError;
use crate::messaging::record::{MessageId, ThreadId};
use crate::store::IdentityStorage;

/// Result of checking a key a message presented
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustCheck {
    /// No key on record yet; trust on first use applies
    FirstUse,
    /// The key is the one we trust
    Trusted,
    /// The key differs from the trusted one
    Mismatch(IdentityKeyMismatch),
}

/// Read-only view over the trust table
#[derive(Clone)]
pub struct TrustEvaluator {
    storage: Arc<dyn IdentityStorage>,
}

impl TrustEvaluator {
    pub fn new(storage: Arc<dyn IdentityStorage>) -> Self {
        Self { storage }
    }

    /// Whether `candidate` is acceptable for `recipient_id` without asking.
    ///
    /// True when nothing is on record yet or the record holds exactly this key.
    pub fn is_trusted(&self, recipient_id: RecipientId, candidate: &IdentityKey) -> Result<bool, IdentityError> {
        Ok(match self.storage.load_identity(recipient_id)? {
            None => true,
            Some(record) => record.identity_key == *candidate,
        })
    }

    /// Classify the key presented by a message, producing the mismatch to
    /// attach to it when the key is unexpected.
    pub fn check(
        &self,
        recipient_id: RecipientId,
        candidate: IdentityKey,
        message_id: MessageId,
        thread_id: ThreadId,
    ) -> Result<TrustCheck, IdentityError> {
        match self.storage.load_identity(recipient_id)? {
            None => {
                debug!("No identity on record for recipient {}", recipient_id);
                Ok(TrustCheck::FirstUse)
            }
            Some(record) if record.identity_key == candidate => Ok(TrustCheck::Trusted),
            Some(record) => {
                warn!(
                    "Identity mismatch for recipient {} in message {}: trusted {}, presented {}",
                    recipient_id, message_id, record.identity_key, candidate
                );
                Ok(TrustCheck::Mismatch(IdentityKeyMismatch::new(
                    recipient_id,
                    candidate,
                    message_id,
                    thread_id,
                )))
            }
        }
    }
}
