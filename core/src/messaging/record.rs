//! Message records as the reconciliation core sees them

use serde::{Deserialize, Serialize};

use crate::crypto::envelope::EnvelopeKind;
use crate::identity::mismatch::{IdentityKeyMismatch, MismatchKey};

/// Message identifier
pub type MessageId = u64;

/// Conversation identifier
pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Who an outgoing message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Individual,
    Group,
}

/// Transport delivery status, owned by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

/// Whether an incoming payload has been fully processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Processed,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub direction: Direction,
    /// Carried in a multimedia envelope rather than a plain text one
    pub is_mms: bool,
    pub destination: Destination,
    /// Set when the body is a key-exchange envelope
    pub envelope_kind: Option<EnvelopeKind>,
    pub body: String,
    /// Unresolved identity mismatches; a multi-recipient message may carry several
    pub mismatches: Vec<IdentityKeyMismatch>,
    pub delivery: DeliveryStatus,
    pub processing: ProcessingState,
    /// Arrival or send time (Unix ms)
    pub timestamp: u64,
}

impl MessageRecord {
    /// A received message awaiting processing
    pub fn incoming(id: MessageId, thread_id: ThreadId, body: &str) -> Self {
        Self::new(id, thread_id, Direction::Incoming, body)
    }

    /// A message we are sending to one recipient
    pub fn outgoing(id: MessageId, thread_id: ThreadId, body: &str) -> Self {
        Self::new(id, thread_id, Direction::Outgoing, body)
    }

    fn new(id: MessageId, thread_id: ThreadId, direction: Direction, body: &str) -> Self {
        Self {
            id,
            thread_id,
            direction,
            is_mms: false,
            destination: Destination::Individual,
            envelope_kind: None,
            body: body.to_string(),
            mismatches: Vec::new(),
            delivery: DeliveryStatus::Pending,
            processing: ProcessingState::Pending,
            timestamp: now_ms(),
        }
    }

    /// Mark the body as a key-exchange envelope of the given kind
    pub fn with_envelope(mut self, kind: EnvelopeKind) -> Self {
        self.envelope_kind = Some(kind);
        self
    }

    /// Address a multimedia message to a group
    pub fn to_group(mut self) -> Self {
        self.is_mms = true;
        self.destination = Destination::Group;
        self
    }

    pub fn as_mms(mut self) -> Self {
        self.is_mms = true;
        self
    }

    pub fn with_mismatch(mut self, mismatch: IdentityKeyMismatch) -> Self {
        self.mismatches.push(mismatch);
        self
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    /// Plain-text messages always have a single recipient
    pub fn targets_group(&self) -> bool {
        self.is_mms && self.destination == Destination::Group
    }

    pub fn has_mismatch(&self, key: &MismatchKey) -> bool {
        self.mismatches.iter().any(|m| key.matches(m))
    }

    /// Drop every mismatch equivalent to `key`, returning how many were removed
    pub fn remove_mismatch(&mut self, key: &MismatchKey) -> usize {
        let before = self.mismatches.len();
        self.mismatches.retain(|m| !key.matches(m));
        before - self.mismatches.len()
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
