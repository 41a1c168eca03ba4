//! Reconciliation engine
//!
//! Accepting a changed identity key runs in three steps:
//!
//! 1. Persist the key as trusted.
//! 2. Reconcile the message that triggered the mismatch.
//! 3. Sweep the thread for sibling messages blocked on an equivalent
//!    mismatch and reconcile each.
//!
//! Step 1 failing aborts everything. Step 2 failing aborts, but the trust
//! update stays. In step 3 a failing record is reported and the sweep moves
//! on. Reconciling a record that no longer carries the mismatch does
//! nothing, so the whole operation can be re-run safely after any abort.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::crypto::envelope::EnvelopeKind;
use crate::identity::mismatch::{IdentityKeyMismatch, MismatchKey};
use crate::identity::store::{IdentityError, IdentityStore};
use crate::messaging::index::MismatchIndex;
use crate::messaging::record::{Direction, MessageId, MessageRecord, ProcessingState};
use crate::reconcile::delivery::{ReprocessQueue, ResendService};
use crate::store::{IdentityStorage, MessageStorage, StorageError};

/// Progress of one acceptance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Started,
    KeyPersisted,
    TriggerReconciled,
    SweepInProgress,
    Completed,
    Aborted,
}

/// What reconciling a single record did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// The record no longer carried the mismatch
    AlreadyClear,
    /// Mismatch cleared, nothing else to do
    Cleared,
    /// Incoming identity update cleared and marked processed
    MarkedProcessed,
    /// Incoming handshake cleared and queued for reprocessing
    ReprocessQueued,
    /// Outgoing message cleared and queued for resend
    ResendRequested,
}

/// Per-record outcomes of one acceptance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Whether the trust table changed
    pub key_changed: bool,
    /// Records changed by this run, in the order they were reconciled
    pub reconciled: Vec<(MessageId, RecordAction)>,
    /// Visits to records that were already clear
    pub already_clear: usize,
    /// Records left flagged because reconciling them failed
    pub failed: Vec<(MessageId, ReconcileError)>,
}

impl ReconcileReport {
    fn record(&mut self, message_id: MessageId, action: RecordAction) {
        match action {
            RecordAction::AlreadyClear => self.already_clear += 1,
            action => self.reconciled.push((message_id, action)),
        }
    }

    /// Action taken for a record, if this run changed it
    pub fn action_for(&self, message_id: MessageId) -> Option<RecordAction> {
        self.reconciled
            .iter()
            .find(|(id, _)| *id == message_id)
            .map(|(_, action)| *action)
    }
}

/// Final result of an operator decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    Aborted {
        /// Last state reached before the failure
        last_state: ReconcileState,
        reason: ReconcileError,
        report: ReconcileReport,
    },
    /// The operator declined the key; nothing changed
    Rejected,
}

impl ReconcileOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReconcileOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            ReconcileOutcome::Completed(report) => Some(report),
            ReconcileOutcome::Aborted { report, .. } => Some(report),
            ReconcileOutcome::Rejected => None,
        }
    }
}

/// Applies an accepted identity key to the trust table and the thread
pub struct ReconciliationEngine {
    identities: IdentityStore,
    messages: Arc<dyn MessageStorage>,
    index: MismatchIndex,
    resend: Arc<dyn ResendService>,
    reprocess: Arc<dyn ReprocessQueue>,
}

impl ReconciliationEngine {
    pub fn new(
        identity_storage: Arc<dyn IdentityStorage>,
        message_storage: Arc<dyn MessageStorage>,
        resend: Arc<dyn ResendService>,
        reprocess: Arc<dyn ReprocessQueue>,
    ) -> Self {
        Self {
            identities: IdentityStore::new(identity_storage),
            index: MismatchIndex::new(Arc::clone(&message_storage)),
            messages: message_storage,
            resend,
            reprocess,
        }
    }

    /// Accept `mismatch.identity_key` for its recipient and reconcile the
    /// thread of `originating`.
    pub fn accept(&self, originating: &MessageRecord, mismatch: &IdentityKeyMismatch) -> ReconcileOutcome {
        let key = mismatch.key();
        let mut state = ReconcileState::Started;
        let mut report = ReconcileReport::default();

        info!(
            "Accepting identity {} for recipient {} from message {} in thread {}",
            key.identity_key, key.recipient_id, originating.id, originating.thread_id
        );

        match self.identities.accept_identity(key.recipient_id, key.identity_key) {
            Ok(changed) => report.key_changed = changed,
            Err(e) => {
                let reason = match e {
                    IdentityError::StoreUnavailable(source) => ReconcileError::StoreUnavailable(source),
                    other => ReconcileError::StoreUnavailable(StorageError::Unavailable(other.to_string())),
                };
                return abort(state, reason, report);
            }
        }
        advance(&mut state, ReconcileState::KeyPersisted);

        match self.reconcile_record(originating.id, &key) {
            Ok(action) => report.record(originating.id, action),
            Err(reason) => return abort(state, reason, report),
        }
        advance(&mut state, ReconcileState::TriggerReconciled);

        let pending = match self.index.pending_mismatches(originating.thread_id) {
            Ok(pending) => pending,
            Err(e) => return abort(state, ReconcileError::ScanFailed(e), report),
        };
        advance(&mut state, ReconcileState::SweepInProgress);

        for item in pending {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable message {} in sweep: {}", e.message_id, e.source);
                    report
                        .failed
                        .push((e.message_id, ReconcileError::RecordReadFailed(e.message_id, e.source)));
                    continue;
                }
            };

            if !record.has_mismatch(&key) {
                continue;
            }
            match self.reconcile_record(record.id, &key) {
                Ok(action) => report.record(record.id, action),
                Err(e) => {
                    warn!("Failed to reconcile message {}: {}", record.id, e);
                    report.failed.push((record.id, e));
                }
            }
        }
        advance(&mut state, ReconcileState::Completed);

        info!(
            "Reconciled {} messages for recipient {} ({} already clear, {} failed)",
            report.reconciled.len(),
            key.recipient_id,
            report.already_clear,
            report.failed.len()
        );
        ReconcileOutcome::Completed(report)
    }

    /// Whether a record is readable and no longer carries the mismatch
    pub fn is_settled(&self, message_id: MessageId, key: &MismatchKey) -> bool {
        self.messages
            .read_message_record(message_id)
            .map(|record| !record.has_mismatch(key))
            .unwrap_or(false)
    }

    /// Clear one record's equivalent mismatches and follow up by direction.
    fn reconcile_record(&self, message_id: MessageId, key: &MismatchKey) -> Result<RecordAction, ReconcileError> {
        let mut record = self.messages.read_message_record(message_id).map_err(|e| match e {
            StorageError::NotFound(id) => ReconcileError::RecordMissing(id),
            other => ReconcileError::RecordReadFailed(message_id, other),
        })?;
        let original = record.clone();

        if record.remove_mismatch(key) == 0 {
            debug!("Message {} already clear of {}", message_id, key.identity_key);
            return Ok(RecordAction::AlreadyClear);
        }

        let action = match record.direction {
            Direction::Incoming => match record.envelope_kind {
                Some(EnvelopeKind::IdentityUpdate) => {
                    // Nothing left to decrypt in an identity update
                    record.processing = ProcessingState::Processed;
                    RecordAction::MarkedProcessed
                }
                Some(EnvelopeKind::PreKeyBundle) | Some(EnvelopeKind::PlainExchange) => {
                    RecordAction::ReprocessQueued
                }
                None => RecordAction::Cleared,
            },
            Direction::Outgoing if record.targets_group() => RecordAction::Cleared,
            Direction::Outgoing => RecordAction::ResendRequested,
        };

        self.messages
            .write_message_record(&record)
            .map_err(|e| ReconcileError::RecordWriteFailed(message_id, e))?;

        let delegated = match action {
            RecordAction::ReprocessQueued => self.reprocess.enqueue_reprocess(message_id),
            RecordAction::ResendRequested => self.resend.resend(&record),
            _ => Ok(()),
        };

        if let Err(e) = delegated {
            // Put the mismatch back so a retry picks the record up again
            if let Err(restore) = self.messages.write_message_record(&original) {
                error!(
                    "Message {} left cleared after failed follow-up, restore failed: {}",
                    message_id, restore
                );
            }
            return Err(ReconcileError::DeliveryFailed(message_id, e.to_string()));
        }

        debug!("Message {}: {:?}", message_id, action);
        Ok(action)
    }
}

fn advance(state: &mut ReconcileState, next: ReconcileState) {
    debug!("Reconciliation {:?} -> {:?}", state, next);
    *state = next;
}

fn abort(last_state: ReconcileState, reason: ReconcileError, report: ReconcileReport) -> ReconcileOutcome {
    error!("Reconciliation aborted after {:?}: {}", last_state, reason);
    ReconcileOutcome::Aborted {
        last_state,
        reason,
        report,
    }
}

/// Reconciliation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Identity store unavailable: {0}")]
    StoreUnavailable(StorageError),
    #[error("Message {0} not found")]
    RecordMissing(MessageId),
    #[error("Failed to read message {0}: {1}")]
    RecordReadFailed(MessageId, StorageError),
    #[error("Failed to write message {0}: {1}")]
    RecordWriteFailed(MessageId, StorageError),
    #[error("Follow-up for message {0} failed: {1}")]
    DeliveryFailed(MessageId, String),
    #[error("Thread scan failed: {0}")]
    ScanFailed(StorageError),
    #[error("Reconciliation worker failed: {0}")]
    WorkerFailed(String),
}
