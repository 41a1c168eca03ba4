//! Engine and scheduler tests against in-memory collaborators

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::crypto::envelope::EnvelopeKind;
use crate::crypto::keys::IdentityKey;
use crate::identity::mismatch::IdentityKeyMismatch;
use crate::identity::record::{IdentityRecord, RecipientId, TrustState};
use crate::messaging::record::{MessageId, MessageRecord, ProcessingState, ThreadId};
use crate::reconcile::delivery::{DeliveryError, ReprocessQueue, ResendService};
use crate::reconcile::engine::{
    ReconcileError, ReconcileOutcome, ReconcileState, ReconciliationEngine, RecordAction,
};
use crate::reconcile::task::ReconcileScheduler;
use crate::store::{IdentityStorage, MemoryStore, MessageStorage, StorageError};

const THREAD: ThreadId = 100;
const ALICE: RecipientId = 7;

fn key(byte: u8) -> IdentityKey {
    IdentityKey::from_public_bytes([byte; 32])
}

fn mismatch(key: IdentityKey, message_id: MessageId) -> IdentityKeyMismatch {
    IdentityKeyMismatch::new(ALICE, key, message_id, THREAD)
}

/// Wraps a MemoryStore, counting identity writes and failing chosen calls
#[derive(Default)]
struct TestStore {
    inner: MemoryStore,
    identity_writes: AtomicUsize,
    identity_offline: bool,
    failing_writes: Mutex<HashSet<MessageId>>,
    failing_reads: Mutex<HashSet<MessageId>>,
}

impl TestStore {
    fn offline() -> Self {
        Self {
            identity_offline: true,
            ..Default::default()
        }
    }

    fn fail_writes_to(&self, id: MessageId) {
        self.failing_writes.lock().unwrap().insert(id);
    }

    fn fail_reads_of(&self, id: MessageId) {
        self.failing_reads.lock().unwrap().insert(id);
    }

    fn put(&self, record: MessageRecord) {
        self.inner.write_message_record(&record).unwrap();
    }

    fn get(&self, id: MessageId) -> MessageRecord {
        self.inner.read_message_record(id).unwrap()
    }
}

impl IdentityStorage for TestStore {
    fn load_identity(&self, recipient_id: RecipientId) -> Result<Option<IdentityRecord>, StorageError> {
        if self.identity_offline {
            return Err(StorageError::Unavailable("offline".to_string()));
        }
        self.inner.load_identity(recipient_id)
    }

    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        if self.identity_offline {
            return Err(StorageError::Unavailable("offline".to_string()));
        }
        self.identity_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save_identity(record)
    }
}

impl MessageStorage for TestStore {
    fn read_message_record(&self, id: MessageId) -> Result<MessageRecord, StorageError> {
        if self.failing_reads.lock().unwrap().contains(&id) {
            return Err(StorageError::Io("bad sector".to_string()));
        }
        self.inner.read_message_record(id)
    }

    fn write_message_record(&self, record: &MessageRecord) -> Result<(), StorageError> {
        if self.failing_writes.lock().unwrap().contains(&record.id) {
            return Err(StorageError::Io("disk full".to_string()));
        }
        self.inner.write_message_record(record)
    }

    fn scan_thread(&self, thread_id: ThreadId) -> Result<Vec<MessageId>, StorageError> {
        self.inner.scan_thread(thread_id)
    }
}

/// Records every delegated request
#[derive(Default)]
struct Recorder {
    resent: Mutex<Vec<MessageId>>,
    reprocessed: Mutex<Vec<MessageId>>,
    reject_resends: bool,
}

impl Recorder {
    fn resent(&self) -> Vec<MessageId> {
        self.resent.lock().unwrap().clone()
    }

    fn reprocessed(&self) -> Vec<MessageId> {
        self.reprocessed.lock().unwrap().clone()
    }
}

impl ResendService for Recorder {
    fn resend(&self, record: &MessageRecord) -> Result<(), DeliveryError> {
        if self.reject_resends {
            return Err(DeliveryError::Rejected("no route".to_string()));
        }
        self.resent.lock().unwrap().push(record.id);
        Ok(())
    }
}

impl ReprocessQueue for Recorder {
    fn enqueue_reprocess(&self, message_id: MessageId) -> Result<(), DeliveryError> {
        self.reprocessed.lock().unwrap().push(message_id);
        Ok(())
    }
}

fn engine(store: &Arc<TestStore>, recorder: &Arc<Recorder>) -> ReconciliationEngine {
    ReconciliationEngine::new(store.clone(), store.clone(), recorder.clone(), recorder.clone())
}

fn completed(outcome: ReconcileOutcome) -> crate::reconcile::engine::ReconcileReport {
    match outcome {
        ReconcileOutcome::Completed(report) => report,
        other => panic!("Expected completion, got {:?}", other),
    }
}

#[test]
fn test_thread_scenario() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);
    let y = key(2);

    let msg1 = MessageRecord::outgoing(1, THREAD, "hello").with_mismatch(mismatch(x, 1));
    store.put(msg1.clone());
    store.put(
        MessageRecord::incoming(2, THREAD, "body")
            .with_envelope(EnvelopeKind::PlainExchange)
            .with_mismatch(mismatch(x, 2)),
    );
    store.put(MessageRecord::outgoing(3, THREAD, "later").with_mismatch(mismatch(y, 3)));

    let report = completed(engine(&store, &recorder).accept(&msg1, &mismatch(x, 1)));

    assert!(report.key_changed);
    assert_eq!(report.action_for(1), Some(RecordAction::ResendRequested));
    assert_eq!(report.action_for(2), Some(RecordAction::ReprocessQueued));
    assert_eq!(report.action_for(3), None);
    assert!(report.failed.is_empty());

    assert_eq!(recorder.resent(), vec![1]);
    assert_eq!(recorder.reprocessed(), vec![2]);
    assert!(store.get(1).mismatches.is_empty());
    assert!(store.get(2).mismatches.is_empty());
    assert_eq!(store.get(2).processing, ProcessingState::Pending);
    assert_eq!(store.get(3).mismatches, vec![mismatch(y, 3)]);

    let trusted = store.load_identity(ALICE).unwrap().unwrap();
    assert_eq!(trusted.identity_key, x);
    assert_eq!(trusted.trust_state, TrustState::Trusted);
}

#[test]
fn test_accept_twice_is_accept_once() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let msg1 = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg1.clone());
    store.put(MessageRecord::outgoing(2, THREAD, "b").with_mismatch(mismatch(x, 2)));

    let engine = engine(&store, &recorder);
    completed(engine.accept(&msg1, &mismatch(x, 1)));
    let second = completed(engine.accept(&msg1, &mismatch(x, 1)));

    assert!(!second.key_changed);
    assert!(second.reconciled.is_empty());
    assert_eq!(second.already_clear, 1);
    assert_eq!(recorder.resent(), vec![1, 2]);
    assert_eq!(store.identity_writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_identity_update_marked_processed() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let update = MessageRecord::incoming(1, THREAD, "key")
        .with_envelope(EnvelopeKind::IdentityUpdate)
        .with_mismatch(mismatch(x, 1));
    store.put(update.clone());

    let report = completed(engine(&store, &recorder).accept(&update, &mismatch(x, 1)));

    assert_eq!(report.action_for(1), Some(RecordAction::MarkedProcessed));
    assert_eq!(store.get(1).processing, ProcessingState::Processed);
    assert!(recorder.reprocessed().is_empty());
}

#[test]
fn test_handshakes_reprocessed_once() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let bundle = MessageRecord::incoming(1, THREAD, "bundle")
        .with_envelope(EnvelopeKind::PreKeyBundle)
        .with_mismatch(mismatch(x, 1));
    store.put(bundle.clone());
    store.put(
        MessageRecord::incoming(2, THREAD, "exchange")
            .with_envelope(EnvelopeKind::PlainExchange)
            .with_mismatch(mismatch(x, 2)),
    );

    completed(engine(&store, &recorder).accept(&bundle, &mismatch(x, 1)));

    assert_eq!(recorder.reprocessed(), vec![1, 2]);
    assert_eq!(store.get(1).processing, ProcessingState::Pending);
    assert_eq!(store.get(2).processing, ProcessingState::Pending);
}

#[test]
fn test_plain_incoming_only_cleared() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let plain = MessageRecord::incoming(1, THREAD, "text").with_mismatch(mismatch(x, 1));
    store.put(plain.clone());

    let report = completed(engine(&store, &recorder).accept(&plain, &mismatch(x, 1)));

    assert_eq!(report.action_for(1), Some(RecordAction::Cleared));
    assert!(recorder.reprocessed().is_empty());
    assert!(store.get(1).mismatches.is_empty());
}

#[test]
fn test_group_message_not_resent() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let group = MessageRecord::outgoing(1, THREAD, "all")
        .to_group()
        .with_mismatch(mismatch(x, 1));
    store.put(group.clone());
    store.put(
        MessageRecord::outgoing(2, THREAD, "mms")
            .as_mms()
            .with_mismatch(mismatch(x, 2)),
    );

    let report = completed(engine(&store, &recorder).accept(&group, &mismatch(x, 1)));

    assert_eq!(report.action_for(1), Some(RecordAction::Cleared));
    assert!(store.get(1).mismatches.is_empty());
    // An individual multimedia message still goes out again
    assert_eq!(recorder.resent(), vec![2]);
}

#[test]
fn test_clearing_keeps_body_and_delivery() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);
    let other = IdentityKeyMismatch::new(ALICE + 1, key(9), 1, THREAD);

    let msg = MessageRecord::outgoing(1, THREAD, "keep me")
        .as_mms()
        .with_mismatch(mismatch(x, 1))
        .with_mismatch(other.clone());
    store.put(msg.clone());

    completed(engine(&store, &recorder).accept(&msg, &mismatch(x, 1)));

    let after = store.get(1);
    assert_eq!(after.body, "keep me");
    assert_eq!(after.delivery, msg.delivery);
    assert_eq!(after.mismatches, vec![other]);
}

#[test]
fn test_store_unavailable_aborts_before_any_record() {
    let store = Arc::new(TestStore::offline());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let msg = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg.clone());

    match engine(&store, &recorder).accept(&msg, &mismatch(x, 1)) {
        ReconcileOutcome::Aborted { last_state, reason, report } => {
            assert_eq!(last_state, ReconcileState::Started);
            assert!(matches!(reason, ReconcileError::StoreUnavailable(_)));
            assert!(report.reconciled.is_empty());
        }
        other => panic!("Expected abort, got {:?}", other),
    }
    assert_eq!(store.get(1), msg);
    assert!(recorder.resent().is_empty());
}

#[test]
fn test_originating_failure_keeps_trust() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let msg = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg.clone());
    store.fail_writes_to(1);

    match engine(&store, &recorder).accept(&msg, &mismatch(x, 1)) {
        ReconcileOutcome::Aborted { last_state, reason, .. } => {
            assert_eq!(last_state, ReconcileState::KeyPersisted);
            assert!(matches!(reason, ReconcileError::RecordWriteFailed(1, _)));
        }
        other => panic!("Expected abort, got {:?}", other),
    }
    assert_eq!(store.load_identity(ALICE).unwrap().unwrap().identity_key, x);
    assert_eq!(store.get(1).mismatches.len(), 1);
}

#[test]
fn test_failing_sibling_does_not_stop_sweep() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let msg1 = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg1.clone());
    store.put(MessageRecord::outgoing(2, THREAD, "b").with_mismatch(mismatch(x, 2)));
    store.put(MessageRecord::outgoing(3, THREAD, "c").with_mismatch(mismatch(x, 3)));
    store.fail_writes_to(2);

    let report = completed(engine(&store, &recorder).accept(&msg1, &mismatch(x, 1)));

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 2);
    assert_eq!(report.action_for(3), Some(RecordAction::ResendRequested));
    assert_eq!(recorder.resent(), vec![1, 3]);
    assert!(store.get(2).has_mismatch(&mismatch(x, 2).key()));
}

#[test]
fn test_unreadable_sibling_does_not_stop_sweep() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);

    let msg1 = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg1.clone());
    store.put(MessageRecord::outgoing(2, THREAD, "b").with_mismatch(mismatch(x, 2)));
    store.put(MessageRecord::outgoing(3, THREAD, "c").with_mismatch(mismatch(x, 3)));
    store.fail_reads_of(2);

    let report = completed(engine(&store, &recorder).accept(&msg1, &mismatch(x, 1)));

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0], (2, ReconcileError::RecordReadFailed(2, _))));
    assert_eq!(report.action_for(3), Some(RecordAction::ResendRequested));
    assert_eq!(recorder.resent(), vec![1, 3]);
    assert!(store.get(2).has_mismatch(&mismatch(x, 2).key()));
}

#[test]
fn test_failed_resend_leaves_record_flagged() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder {
        reject_resends: true,
        ..Default::default()
    });
    let x = key(1);

    let msg1 = MessageRecord::incoming(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg1.clone());
    store.put(MessageRecord::outgoing(2, THREAD, "b").with_mismatch(mismatch(x, 2)));

    let report = completed(engine(&store, &recorder).accept(&msg1, &mismatch(x, 1)));

    assert!(matches!(report.failed[0], (2, ReconcileError::DeliveryFailed(2, _))));
    assert_eq!(store.get(2).mismatches, vec![mismatch(x, 2)]);
}

#[test]
fn test_reject_changes_nothing() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);
    let msg = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg.clone());

    let scheduler = ReconcileScheduler::new(Arc::new(engine(&store, &recorder)), runtime.handle().clone());
    assert_eq!(scheduler.reject(&mismatch(x, 1)), ReconcileOutcome::Rejected);

    assert_eq!(store.get(1), msg);
    assert!(store.load_identity(ALICE).unwrap().is_none());
    assert_eq!(scheduler.in_flight(), 0);
}

/// Holds the first resend until the test releases it
struct GatedResend {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    count: AtomicUsize,
}

impl ResendService for GatedResend {
    fn resend(&self, _record: &MessageRecord) -> Result<(), DeliveryError> {
        if self.count.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(())
    }
}

fn gated() -> (Arc<GatedResend>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Arc::new(GatedResend {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
        count: AtomicUsize::new(0),
    });
    (gate, entered_rx, release_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equivalent_requests_coalesce() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let (gate, entered_rx, release_tx) = gated();
    let x = key(1);

    let msg1 = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    let msg2 = MessageRecord::outgoing(2, THREAD, "b").with_mismatch(mismatch(x, 2));
    store.put(msg1.clone());
    store.put(msg2.clone());

    let engine = ReconciliationEngine::new(store.clone(), store.clone(), gate.clone(), recorder);
    let scheduler = ReconcileScheduler::new(Arc::new(engine), tokio::runtime::Handle::current());

    let first = scheduler.accept(msg1, mismatch(x, 1));
    assert!(!first.is_coalesced());
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // Same recipient and key, different originating message
    let second = scheduler.accept(msg2, mismatch(x, 2));
    assert!(second.is_coalesced());
    assert_eq!(scheduler.in_flight(), 1);

    release_tx.send(()).unwrap();
    let (a, b) = tokio::join!(first.wait(), second.wait());

    assert!(a.is_completed());
    assert_eq!(a, b);
    // msg1 then msg2, each once
    assert_eq!(gate.count.load(Ordering::SeqCst), 2);
    assert_eq!(store.identity_writes.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equivalent_request_from_other_thread_sweeps_it() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let (gate, entered_rx, release_tx) = gated();
    let x = key(1);
    let other_thread = THREAD + 1;

    let msg1 = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    let elsewhere = IdentityKeyMismatch::new(ALICE, x, 2, other_thread);
    let msg2 = MessageRecord::outgoing(2, other_thread, "b").with_mismatch(elsewhere.clone());
    let third = IdentityKeyMismatch::new(ALICE, x, 3, other_thread);
    store.put(msg1.clone());
    store.put(msg2.clone());
    store.put(MessageRecord::incoming(3, other_thread, "c").with_mismatch(third));

    let engine = ReconciliationEngine::new(store.clone(), store.clone(), gate.clone(), recorder);
    let scheduler = ReconcileScheduler::new(Arc::new(engine), tokio::runtime::Handle::current());

    let first = scheduler.accept(msg1, mismatch(x, 1));
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let second = scheduler.accept(msg2, elsewhere);
    assert!(second.is_coalesced());

    release_tx.send(()).unwrap();
    let (a, b) = tokio::join!(first.wait(), second.wait());

    assert_eq!(a.report().and_then(|r| r.action_for(2)), None);
    let report = completed(b);
    assert_eq!(report.action_for(2), Some(RecordAction::ResendRequested));
    assert_eq!(report.action_for(3), Some(RecordAction::Cleared));
    assert!(store.get(2).mismatches.is_empty());
    assert!(store.get(3).mismatches.is_empty());
    assert_eq!(gate.count.load(Ordering::SeqCst), 2);
    assert_eq!(store.identity_writes.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_callback_receives_outcome() {
    let store = Arc::new(TestStore::default());
    let recorder = Arc::new(Recorder::default());
    let x = key(1);
    let msg = MessageRecord::outgoing(1, THREAD, "a").with_mismatch(mismatch(x, 1));
    store.put(msg.clone());

    let scheduler = ReconcileScheduler::new(
        Arc::new(engine(&store, &recorder)),
        tokio::runtime::Handle::current(),
    );
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    scheduler.accept_with_callback(
        msg,
        mismatch(x, 1),
        Box::new(move |outcome: ReconcileOutcome| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
        }),
    );

    let outcome = rx.await.unwrap();
    assert_eq!(
        outcome.report().and_then(|r| r.action_for(1)),
        Some(RecordAction::ResendRequested)
    );
}
