//! In-memory tables shared by the storage backends

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::record::{IdentityRecord, RecipientId};
use crate::messaging::record::{MessageId, MessageRecord, ThreadId};

#[derive(Debug, Default)]
pub(crate) struct Tables {
    identities: HashMap<RecipientId, IdentityRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    /// Message ids in arrival order
    arrival: Vec<MessageId>,
}

/// On-disk form of the identity table
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct IdentityDocument {
    pub identities: Vec<IdentityRecord>,
}

/// On-disk form of the message table, in arrival order
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct MessageDocument {
    pub messages: Vec<MessageRecord>,
}

impl Tables {
    pub fn from_documents(identities: IdentityDocument, messages: MessageDocument) -> Self {
        let mut tables = Self::default();
        for record in identities.identities {
            tables.identities.insert(record.recipient_id, record);
        }
        for record in messages.messages {
            tables.put_message(record);
        }
        tables
    }

    pub fn identity(&self, recipient_id: RecipientId) -> Option<IdentityRecord> {
        self.identities.get(&recipient_id).cloned()
    }

    /// Returns the record that was replaced
    pub fn put_identity(&mut self, record: IdentityRecord) -> Option<IdentityRecord> {
        self.identities.insert(record.recipient_id, record)
    }

    /// Undo a `put_identity`
    pub fn restore_identity(&mut self, recipient_id: RecipientId, previous: Option<IdentityRecord>) {
        match previous {
            Some(record) => {
                self.identities.insert(recipient_id, record);
            }
            None => {
                self.identities.remove(&recipient_id);
            }
        }
    }

    pub fn message(&self, id: MessageId) -> Option<MessageRecord> {
        self.messages.get(&id).cloned()
    }

    /// Returns the record that was replaced
    pub fn put_message(&mut self, record: MessageRecord) -> Option<MessageRecord> {
        let id = record.id;
        let previous = self.messages.insert(id, record);
        if previous.is_none() {
            self.arrival.push(id);
        }
        previous
    }

    /// Undo a `put_message`
    pub fn restore_message(&mut self, id: MessageId, previous: Option<MessageRecord>) {
        match previous {
            Some(record) => {
                self.messages.insert(id, record);
            }
            None => {
                self.messages.remove(&id);
                self.arrival.retain(|m| *m != id);
            }
        }
    }

    pub fn thread(&self, thread_id: ThreadId) -> Vec<MessageId> {
        self.arrival
            .iter()
            .filter(|id| {
                self.messages
                    .get(*id)
                    .map(|m| m.thread_id == thread_id)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn identity_document(&self) -> IdentityDocument {
        let mut identities: Vec<_> = self.identities.values().cloned().collect();
        identities.sort_by_key(|r| r.recipient_id);
        IdentityDocument { identities }
    }

    pub fn message_document(&self) -> MessageDocument {
        MessageDocument {
            messages: self
                .arrival
                .iter()
                .filter_map(|id| self.messages.get(id).cloned())
                .collect(),
        }
    }
}
