//! Trust decisions for the presentation layer
//!
//! Wraps the trust table, the mismatch index and the scheduler behind one
//! facade, with queues for UI events and delivery requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{ConfigError, ReconcileConfig};
use crate::crypto::envelope::{self, EnvelopeError};
use crate::crypto::keys::IdentityKey;
use crate::identity::mismatch::IdentityKeyMismatch;
use crate::identity::record::RecipientId;
use crate::identity::store::{IdentityError, IdentityStore};
use crate::identity::trust::{TrustCheck, TrustEvaluator};
use crate::messaging::index::MismatchIndex;
use crate::messaging::record::{MessageId, ThreadId};
use crate::reconcile::delivery::{DeliveryQueue, DeliveryRequest};
use crate::reconcile::engine::{ReconcileOutcome, ReconciliationEngine};
use crate::reconcile::task::{ReconcileHandle, ReconcileScheduler};
use crate::store::{FileStore, IdentityStorage, MemoryStore, MessageStorage, StorageError};

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEvent {
    MismatchDetected {
        thread_id: ThreadId,
        message_id: MessageId,
        recipient_id: RecipientId,
        fingerprint: String,
    },
    Reconciled {
        thread_id: ThreadId,
        message_id: MessageId,
        outcome: ReconcileOutcome,
    },
    Rejected {
        thread_id: ThreadId,
        message_id: MessageId,
    },
}

/// Trust decisions exposed to the UI
pub struct TrustAPI {
    identities: IdentityStore,
    evaluator: TrustEvaluator,
    messages: Arc<dyn MessageStorage>,
    index: MismatchIndex,
    scheduler: ReconcileScheduler,
    delivery: Arc<DeliveryQueue>,
    events: Arc<Mutex<VecDeque<TrustEvent>>>,
}

impl TrustAPI {
    /// Open the stores named by `config` and run reconciliations on `runtime`
    pub fn open(config: &ReconcileConfig, runtime: Handle) -> Result<Self, ApiError> {
        config.validate()?;
        match &config.data_dir {
            Some(dir) => {
                let store = Arc::new(FileStore::open(dir)?);
                Ok(Self::with_storage(store.clone(), store, runtime))
            }
            None => {
                let store = Arc::new(MemoryStore::new());
                Ok(Self::with_storage(store.clone(), store, runtime))
            }
        }
    }

    pub fn with_storage(
        identity_storage: Arc<dyn IdentityStorage>,
        message_storage: Arc<dyn MessageStorage>,
        runtime: Handle,
    ) -> Self {
        let delivery = Arc::new(DeliveryQueue::new());
        let engine = ReconciliationEngine::new(
            Arc::clone(&identity_storage),
            Arc::clone(&message_storage),
            delivery.clone(),
            delivery.clone(),
        );

        Self {
            identities: IdentityStore::new(Arc::clone(&identity_storage)),
            evaluator: TrustEvaluator::new(identity_storage),
            index: MismatchIndex::new(Arc::clone(&message_storage)),
            messages: message_storage,
            scheduler: ReconcileScheduler::new(Arc::new(engine), runtime),
            delivery,
            events: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Check the identity key carried by a stored key-exchange message.
    ///
    /// A first key is pinned. A changed key is attached to the message as a
    /// mismatch and announced with [`TrustEvent::MismatchDetected`].
    pub fn evaluate_envelope(&self, recipient_id: RecipientId, message_id: MessageId) -> Result<TrustCheck, ApiError> {
        let mut record = self.messages.read_message_record(message_id)?;
        let kind = record.envelope_kind.ok_or(ApiError::NotAnEnvelope(message_id))?;
        let candidate = envelope::decode(&record.body, kind)?;

        let check = self.evaluator.check(recipient_id, candidate, message_id, record.thread_id)?;
        match &check {
            TrustCheck::FirstUse => {
                self.identities.record_first_use(recipient_id, candidate)?;
            }
            TrustCheck::Trusted => {}
            TrustCheck::Mismatch(mismatch) => {
                if !record.has_mismatch(&mismatch.key()) {
                    record.mismatches.push(mismatch.clone());
                    self.messages.write_message_record(&record)?;
                }
                self.push_event(TrustEvent::MismatchDetected {
                    thread_id: record.thread_id,
                    message_id,
                    recipient_id,
                    fingerprint: candidate.fingerprint(),
                });
            }
        }
        Ok(check)
    }

    /// Every unresolved mismatch in a thread, in arrival order
    pub fn pending_mismatches(&self, thread_id: ThreadId) -> Result<Vec<IdentityKeyMismatch>, ApiError> {
        let mut pending = Vec::new();
        for item in self.index.pending_mismatches(thread_id)? {
            match item {
                Ok(record) => pending.extend(record.mismatches),
                Err(e) => warn!("Skipping message {}: {}", e.message_id, e.source),
            }
        }
        Ok(pending)
    }

    /// Operator accepted the key. The outcome arrives as [`TrustEvent::Reconciled`].
    pub fn accept(&self, message_id: MessageId, mismatch: IdentityKeyMismatch) -> Result<(), ApiError> {
        let record = self.messages.read_message_record(message_id)?;
        let thread_id = record.thread_id;
        let events = Arc::clone(&self.events);

        self.scheduler.accept_with_callback(
            record,
            mismatch,
            Box::new(move |outcome: ReconcileOutcome| {
                if let Ok(mut queue) = events.lock() {
                    queue.push_back(TrustEvent::Reconciled {
                        thread_id,
                        message_id,
                        outcome,
                    });
                }
            }),
        );
        Ok(())
    }

    /// Operator accepted the key; await the outcome on the returned handle
    pub fn submit(&self, message_id: MessageId, mismatch: IdentityKeyMismatch) -> Result<ReconcileHandle, ApiError> {
        let record = self.messages.read_message_record(message_id)?;
        Ok(self.scheduler.accept(record, mismatch))
    }

    /// Operator declined the key
    pub fn reject(&self, mismatch: &IdentityKeyMismatch) -> ReconcileOutcome {
        let outcome = self.scheduler.reject(mismatch);
        self.push_event(TrustEvent::Rejected {
            thread_id: mismatch.thread_id,
            message_id: mismatch.message_id,
        });
        outcome
    }

    /// Fingerprint of the key currently trusted for a recipient
    pub fn fingerprint(&self, recipient_id: RecipientId) -> Result<Option<String>, ApiError> {
        Ok(self
            .identities
            .identity(recipient_id)?
            .map(|record| record.identity_key.fingerprint()))
    }

    /// Operator compared fingerprints out of band
    pub fn verify(&self, recipient_id: RecipientId, key: IdentityKey) -> Result<(), ApiError> {
        self.identities.mark_verified(recipient_id, key)?;
        info!("Recipient {} marked verified", recipient_id);
        Ok(())
    }

    pub fn next_event(&self) -> Option<TrustEvent> {
        self.events.lock().ok()?.pop_front()
    }

    /// Next resend or reprocess request for the transport and decrypt pipeline
    pub fn next_delivery(&self) -> Option<DeliveryRequest> {
        self.delivery.next_request()
    }

    fn push_event(&self, event: TrustEvent) {
        if let Ok(mut queue) = self.events.lock() {
            queue.push_back(event);
        }
    }
}

/// Facade errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Message {0} is not a key-exchange message")]
    NotAnEnvelope(MessageId),
}
