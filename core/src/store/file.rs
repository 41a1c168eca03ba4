//! JSON file storage backend
//!
//! Keeps two documents in the data directory, `identities.json` and
//! `messages.json`. Every write rewrites the affected document through a
//! temporary file and a rename, so a crash leaves either the old or the new
//! document on disk. A failed write is rolled back in memory as well.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::identity::record::{IdentityRecord, RecipientId};
use crate::messaging::record::{MessageId, MessageRecord, ThreadId};
use crate::store::tables::{IdentityDocument, MessageDocument, Tables};
use crate::store::{IdentityStorage, MessageStorage, StorageError};

const IDENTITY_FILE: &str = "identities.json";
const MESSAGE_FILE: &str = "messages.json";

/// Storage persisted as JSON documents in a directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Open (or create) a store in `dir`.
    ///
    /// Missing documents start empty. A document that exists but can't be
    /// parsed is an error: silently starting fresh would forget trust.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let identities: IdentityDocument = load_document(&dir.join(IDENTITY_FILE))?;
        let messages: MessageDocument = load_document(&dir.join(MESSAGE_FILE))?;
        info!(
            "Loaded {} identities and {} messages from {}",
            identities.identities.len(),
            messages.messages.len(),
            dir.display()
        );

        Ok(Self {
            dir,
            tables: Mutex::new(Tables::from_documents(identities, messages)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("file store lock poisoned".to_string()))
    }
}

impl IdentityStorage for FileStore {
    fn load_identity(&self, recipient_id: RecipientId) -> Result<Option<IdentityRecord>, StorageError> {
        Ok(self.tables()?.identity(recipient_id))
    }

    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        let previous = tables.put_identity(record.clone());

        if let Err(e) = save_document(&self.dir.join(IDENTITY_FILE), &tables.identity_document()) {
            error!("Failed to persist identity for recipient {}: {}", record.recipient_id, e);
            tables.restore_identity(record.recipient_id, previous);
            return Err(StorageError::Unavailable(e.to_string()));
        }
        Ok(())
    }
}

impl MessageStorage for FileStore {
    fn read_message_record(&self, id: MessageId) -> Result<MessageRecord, StorageError> {
        self.tables()?.message(id).ok_or(StorageError::NotFound(id))
    }

    fn write_message_record(&self, record: &MessageRecord) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        let previous = tables.put_message(record.clone());

        if let Err(e) = save_document(&self.dir.join(MESSAGE_FILE), &tables.message_document()) {
            error!("Failed to persist message {}: {}", record.id, e);
            tables.restore_message(record.id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn scan_thread(&self, thread_id: ThreadId) -> Result<Vec<MessageId>, StorageError> {
        Ok(self.tables()?.thread(thread_id))
    }
}

fn load_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    if !path.exists() {
        debug!("{} not found, starting empty", path.display());
        return Ok(T::default());
    }

    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        error!("Failed to parse {}: {}", path.display(), e);
        StorageError::Serialization(format!("{}: {}", path.display(), e))
    })
}

fn save_document<T: Serialize>(path: &Path, document: &T) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
