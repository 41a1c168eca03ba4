//! Storage collaborators
//!
//! The reconciliation core only needs a narrow view of persistence: load and
//! save identity records, and read, write and scan message records. Each
//! call is atomic on its own; nothing here spans several records.

mod tables;
pub mod memory;
pub mod file;

pub use memory::MemoryStore;
pub use file::FileStore;

use crate::identity::record::{IdentityRecord, RecipientId};
use crate::messaging::record::{MessageId, MessageRecord, ThreadId};

/// Durable trust table
pub trait IdentityStorage: Send + Sync {
    /// Current record for a recipient, if any
    fn load_identity(&self, recipient_id: RecipientId) -> Result<Option<IdentityRecord>, StorageError>;

    /// Insert or overwrite the record for `record.recipient_id`
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StorageError>;
}

/// Message record table
pub trait MessageStorage: Send + Sync {
    fn read_message_record(&self, id: MessageId) -> Result<MessageRecord, StorageError>;

    /// Insert or overwrite a record. New records join the end of their thread.
    fn write_message_record(&self, record: &MessageRecord) -> Result<(), StorageError>;

    /// Ids of every record in a thread, in arrival order
    fn scan_thread(&self, thread_id: ThreadId) -> Result<Vec<MessageId>, StorageError>;
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Message {0} not found")]
    NotFound(MessageId),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
