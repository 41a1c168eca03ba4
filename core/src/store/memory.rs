//! Ephemeral storage backend

use std::sync::{Mutex, MutexGuard};

use crate::identity::record::{IdentityRecord, RecipientId};
use crate::messaging::record::{MessageId, MessageRecord, ThreadId};
use crate::store::tables::Tables;
use crate::store::{IdentityStorage, MessageStorage, StorageError};

/// Identity and message tables held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl IdentityStorage for MemoryStore {
    fn load_identity(&self, recipient_id: RecipientId) -> Result<Option<IdentityRecord>, StorageError> {
        Ok(self.tables()?.identity(recipient_id))
    }

    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        self.tables()?.put_identity(record.clone());
        Ok(())
    }
}

impl MessageStorage for MemoryStore {
    fn read_message_record(&self, id: MessageId) -> Result<MessageRecord, StorageError> {
        self.tables()?.message(id).ok_or(StorageError::NotFound(id))
    }

    fn write_message_record(&self, record: &MessageRecord) -> Result<(), StorageError> {
        self.tables()?.put_message(record.clone());
        Ok(())
    }

    fn scan_thread(&self, thread_id: ThreadId) -> Result<Vec<MessageId>, StorageError> {
        Ok(self.tables()?.thread(thread_id))
    }
}
