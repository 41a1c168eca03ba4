//! Trusted identity records

use serde::{Deserialize, Serialize};

use crate::crypto::keys::IdentityKey;

/// Recipient identifier (one per correspondent)
pub type RecipientId = u64;

/// How much we trust the stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustState {
    /// Pinned on first contact, never confirmed
    Fresh,
    /// Accepted by the operator after a key change
    Trusted,
    /// Fingerprint compared out of band
    Verified,
}

/// The currently trusted identity key for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub recipient_id: RecipientId,
    pub identity_key: IdentityKey,
    pub trust_state: TrustState,
    /// Last update (Unix ms)
    pub updated_at: u64,
}

impl IdentityRecord {
    pub fn new(recipient_id: RecipientId, identity_key: IdentityKey, trust_state: TrustState) -> Self {
        Self {
            recipient_id,
            identity_key,
            trust_state,
            updated_at: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
