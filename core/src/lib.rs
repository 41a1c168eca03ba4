//! Keychange Core Library
//!
//! Handles a correspondent's identity key changing: decodes key-exchange
//! envelopes, keeps the trust table, and once the operator accepts a new
//! key, reconciles every message in the conversation that was blocked on it.

// Modules
pub mod api;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod logger;
pub mod messaging;
pub mod reconcile;
pub mod store;
mod util;

// Re-export logger types
pub use logger::{init_logger, CoreLogger};

// Re-export crypto types
pub use crypto::{decode, EnvelopeError, EnvelopeKind, IdentityKey, IdentityKeyPair, KeyExchangeEnvelope};

// Re-export identity and messaging types
pub use identity::{IdentityKeyMismatch, IdentityRecord, IdentityStore, MismatchKey, RecipientId, TrustCheck, TrustEvaluator, TrustState};
pub use messaging::{MessageId, MessageRecord, MismatchIndex, ThreadId};

// Re-export reconciliation types
pub use reconcile::{
    ReconcileCallback, ReconcileError, ReconcileHandle, ReconcileOutcome, ReconcileReport,
    ReconcileScheduler, ReconcileState, ReconciliationEngine, RecordAction,
};
pub use reconcile::{DeliveryError, DeliveryQueue, DeliveryRequest, ReprocessQueue, ResendService};

// Re-export storage and API types
pub use store::{FileStore, IdentityStorage, MemoryStore, MessageStorage, StorageError};
pub use api::{ApiError, TrustAPI, TrustEvent};
pub use config::{ConfigError, ReconcileConfig};
