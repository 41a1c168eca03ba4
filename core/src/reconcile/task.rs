//! Background reconciliation with per-mismatch coalescing
//!
//! One worker runs per [`MismatchKey`]. Requests for an equivalent mismatch
//! that arrive while it runs join its queue. A joiner whose thread was
//! already swept, and whose own record is now clear, shares that sweep's
//! outcome. Any other joiner gets a sweep of its own thread on the same
//! worker before the key is released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::identity::mismatch::{IdentityKeyMismatch, MismatchKey};
use crate::messaging::record::{MessageRecord, ThreadId};
use crate::reconcile::engine::{
    ReconcileError, ReconcileOutcome, ReconcileState, ReconciliationEngine,
};

/// Completion callback for the presentation layer
pub trait ReconcileCallback: Send + 'static {
    fn on_complete(&self, outcome: ReconcileOutcome);
}

impl<F> ReconcileCallback for F
where
    F: Fn(ReconcileOutcome) + Send + 'static,
{
    fn on_complete(&self, outcome: ReconcileOutcome) {
        self(outcome)
    }
}

/// A caller waiting on the worker for its key
struct Waiter {
    record: MessageRecord,
    mismatch: IdentityKeyMismatch,
    tx: oneshot::Sender<ReconcileOutcome>,
}

/// Waiters not yet picked up by the worker, per key in flight
type Registry = HashMap<MismatchKey, Vec<Waiter>>;

/// Runs acceptances on the blocking pool, one worker per mismatch
#[derive(Clone)]
pub struct ReconcileScheduler {
    engine: Arc<ReconciliationEngine>,
    runtime: Handle,
    in_flight: Arc<Mutex<Registry>>,
}

impl ReconcileScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, runtime: Handle) -> Self {
        Self {
            engine,
            runtime,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start reconciling `mismatch`, or join the worker already in flight
    /// for an equivalent one.
    pub fn accept(&self, record: MessageRecord, mismatch: IdentityKeyMismatch) -> ReconcileHandle {
        let key = mismatch.key();
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { record, mismatch, tx };

        {
            let mut registry = lock(&self.in_flight);
            if let Some(queued) = registry.get_mut(&key) {
                debug!(
                    "Joining in-flight reconciliation for recipient {} ({}) from thread {}",
                    key.recipient_id, key.identity_key, waiter.record.thread_id
                );
                queued.push(waiter);
                return ReconcileHandle {
                    key,
                    coalesced: true,
                    rx,
                };
            }
            registry.insert(key, vec![waiter]);
        }

        let guard = InFlightGuard {
            key,
            registry: Arc::clone(&self.in_flight),
            released: false,
        };
        let engine = Arc::clone(&self.engine);
        self.runtime.spawn_blocking(move || run_worker(&engine, guard));

        ReconcileHandle {
            key,
            coalesced: false,
            rx,
        }
    }

    /// Like [`accept`](Self::accept), handing the outcome to `callback` on
    /// the runtime instead of returning a handle.
    pub fn accept_with_callback(
        &self,
        record: MessageRecord,
        mismatch: IdentityKeyMismatch,
        callback: Box<dyn ReconcileCallback>,
    ) {
        let handle = self.accept(record, mismatch);
        self.runtime.spawn(async move {
            let outcome = handle.wait().await;
            callback.on_complete(outcome);
        });
    }

    /// The operator declined the key. Nothing is written.
    pub fn reject(&self, mismatch: &IdentityKeyMismatch) -> ReconcileOutcome {
        info!(
            "Identity {} for recipient {} rejected",
            mismatch.identity_key, mismatch.recipient_id
        );
        ReconcileOutcome::Rejected
    }

    /// Number of mismatches currently being reconciled
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

/// Serve waiters for one key until none are left, then release the key.
fn run_worker(engine: &ReconciliationEngine, mut guard: InFlightGuard) {
    let key = guard.key;
    let mut swept: HashMap<ThreadId, ReconcileOutcome> = HashMap::new();

    loop {
        let batch = {
            let mut registry = lock(&guard.registry);
            match registry.get_mut(&key) {
                Some(queued) if !queued.is_empty() => std::mem::take(queued),
                _ => {
                    registry.remove(&key);
                    guard.released = true;
                    break;
                }
            }
        };

        for waiter in batch {
            let thread_id = waiter.record.thread_id;
            let shared = swept
                .get(&thread_id)
                .filter(|_| engine.is_settled(waiter.record.id, &key))
                .cloned();

            let outcome = match shared {
                Some(outcome) => outcome,
                None => {
                    let outcome = sweep(engine, &waiter);
                    swept.insert(thread_id, outcome.clone());
                    outcome
                }
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    info!(
        "Reconciliation for recipient {} finished after sweeping {} thread(s)",
        key.recipient_id,
        swept.len()
    );
}

fn sweep(engine: &ReconciliationEngine, waiter: &Waiter) -> ReconcileOutcome {
    let run = AssertUnwindSafe(|| engine.accept(&waiter.record, &waiter.mismatch));
    catch_unwind(run).unwrap_or_else(|_| {
        error!("Reconciliation worker panicked for message {}", waiter.record.id);
        worker_failed("reconciliation worker panicked")
    })
}

/// Releases the key if the worker exits without doing so, dropping any
/// queued waiters so their handles resolve.
struct InFlightGuard {
    key: MismatchKey,
    registry: Arc<Mutex<Registry>>,
    released: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.released {
            error!(
                "Reconciliation worker for recipient {} exited early",
                self.key.recipient_id
            );
            lock(&self.registry).remove(&self.key);
        }
    }
}

/// Pending result of a scheduled reconciliation
#[derive(Debug)]
pub struct ReconcileHandle {
    key: MismatchKey,
    coalesced: bool,
    rx: oneshot::Receiver<ReconcileOutcome>,
}

impl ReconcileHandle {
    pub fn key(&self) -> MismatchKey {
        self.key
    }

    /// Whether this request joined a worker that was already in flight
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    pub async fn wait(self) -> ReconcileOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| worker_failed("reconciliation worker dropped"))
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Must not be called from inside the runtime.
    pub fn blocking_wait(self) -> ReconcileOutcome {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| worker_failed("reconciliation worker dropped"))
    }
}

fn worker_failed(reason: &str) -> ReconcileOutcome {
    ReconcileOutcome::Aborted {
        last_state: ReconcileState::Started,
        reason: ReconcileError::WorkerFailed(reason.to_string()),
        report: Default::default(),
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // The registry stays consistent even if a holder panicked
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
