//! Identity store: the single write path for trusted keys

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::keys::IdentityKey;
use crate::identity::record::{IdentityRecord, RecipientId, TrustState};
use crate::store::{IdentityStorage, StorageError};

/// Durable trust table
#[derive(Clone)]
pub struct IdentityStore {
    storage: Arc<dyn IdentityStorage>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn IdentityStorage>) -> Self {
        Self { storage }
    }

    /// Current record for a recipient
    pub fn identity(&self, recipient_id: RecipientId) -> Result<Option<IdentityRecord>, IdentityError> {
        Ok(self.storage.load_identity(recipient_id)?)
    }

    /// Trust `key` for `recipient_id` after the operator accepted it.
    ///
    /// Returns whether anything was written. Accepting the key that is
    /// already stored leaves the record untouched.
    pub fn accept_identity(&self, recipient_id: RecipientId, key: IdentityKey) -> Result<bool, IdentityError> {
        let current = self.storage.load_identity(recipient_id)?;

        if let Some(record) = &current {
            if record.identity_key == key {
                debug!("Recipient {} already trusts {}", recipient_id, key);
                return Ok(false);
            }
        }

        let record = IdentityRecord::new(recipient_id, key, TrustState::Trusted);
        self.storage.save_identity(&record)?;

        match current {
            Some(previous) => info!(
                "Recipient {} identity changed {} -> {}",
                recipient_id, previous.identity_key, key
            ),
            None => info!("Recipient {} identity accepted: {}", recipient_id, key),
        }
        Ok(true)
    }

    /// Pin the first key seen for a recipient.
    ///
    /// Does nothing if a record already exists; returns whether it pinned.
    pub fn record_first_use(&self, recipient_id: RecipientId, key: IdentityKey) -> Result<bool, IdentityError> {
        if self.storage.load_identity(recipient_id)?.is_some() {
            return Ok(false);
        }

        self.storage
            .save_identity(&IdentityRecord::new(recipient_id, key, TrustState::Fresh))?;
        info!("Recipient {} pinned on first use: {}", recipient_id, key);
        Ok(true)
    }

    /// Record that the operator compared fingerprints for the current key
    pub fn mark_verified(&self, recipient_id: RecipientId, key: IdentityKey) -> Result<(), IdentityError> {
        let record = match self.storage.load_identity(recipient_id)? {
            Some(record) if record.identity_key == key => record,
            _ => {
                warn!("Refusing to verify {} for recipient {}: not the trusted key", key, recipient_id);
                return Err(IdentityError::KeyNotTrusted(recipient_id));
            }
        };

        if record.trust_state == TrustState::Verified {
            return Ok(());
        }

        self.storage
            .save_identity(&IdentityRecord::new(recipient_id, key, TrustState::Verified))?;
        info!("Recipient {} verified: {}", recipient_id, key);
        Ok(())
    }
}

/// Identity errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),
    #[error("Key is not the trusted key for recipient {0}")]
    KeyNotTrusted(RecipientId),
}
