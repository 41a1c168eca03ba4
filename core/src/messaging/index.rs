//! Per-thread index of messages blocked on identity mismatches

use std::sync::Arc;

use crate::messaging::record::{MessageId, MessageRecord, ThreadId};
use crate::store::{MessageStorage, StorageError};

/// Finds messages in a thread that still carry identity mismatches
#[derive(Clone)]
pub struct MismatchIndex {
    storage: Arc<dyn MessageStorage>,
}

impl MismatchIndex {
    pub fn new(storage: Arc<dyn MessageStorage>) -> Self {
        Self { storage }
    }

    /// Start a sweep over `thread_id`.
    ///
    /// The thread's membership is fixed when the sweep starts; each record is
    /// read only when the sweep reaches it, so changes made earlier in the same
    /// sweep are visible. Call again to restart.
    pub fn pending_mismatches(&self, thread_id: ThreadId) -> Result<PendingMismatches, StorageError> {
        let ids = self.storage.scan_thread(thread_id)?;
        Ok(PendingMismatches {
            storage: Arc::clone(&self.storage),
            ids: ids.into_iter(),
        })
    }
}

/// Lazy sweep over one thread
pub struct PendingMismatches {
    storage: Arc<dyn MessageStorage>,
    ids: std::vec::IntoIter<MessageId>,
}

impl Iterator for PendingMismatches {
    type Item = Result<MessageRecord, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            match self.storage.read_message_record(id) {
                Ok(record) if record.mismatches.is_empty() => continue,
                Ok(record) => return Some(Ok(record)),
                // Removed by someone else since the scan
                Err(StorageError::NotFound(_)) => continue,
                Err(source) => {
                    return Some(Err(IndexError {
                        message_id: id,
                        source,
                    }))
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}

/// A record in the sweep couldn't be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to read message {message_id}: {source}")]
pub struct IndexError {
    pub message_id: MessageId,
    pub source: StorageError,
}
