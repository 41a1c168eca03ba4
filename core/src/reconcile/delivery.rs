//! Delegated resend and reprocess requests

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::info;

use crate::messaging::record::{MessageId, MessageRecord, ThreadId};

/// Re-attempts delivery of an outgoing message over its preferred channel
pub trait ResendService: Send + Sync {
    fn resend(&self, record: &MessageRecord) -> Result<(), DeliveryError>;
}

/// Schedules full protocol processing of an incoming message's payload
pub trait ReprocessQueue: Send + Sync {
    fn enqueue_reprocess(&self, message_id: MessageId) -> Result<(), DeliveryError>;
}

/// A request handed to the transport or decrypt pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRequest {
    Resend {
        message_id: MessageId,
        thread_id: ThreadId,
    },
    Reprocess {
        message_id: MessageId,
    },
}

/// Collects requests for the host to drain, like an outbox
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    requests: Mutex<VecDeque<DeliveryRequest>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next request to hand to the transport or decrypt pipeline
    pub fn next_request(&self) -> Option<DeliveryRequest> {
        self.requests.lock().ok()?.pop_front()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, request: DeliveryRequest) -> Result<(), DeliveryError> {
        self.requests
            .lock()
            .map_err(|_| DeliveryError::Unavailable("delivery queue lock poisoned".to_string()))?
            .push_back(request);
        Ok(())
    }
}

impl ResendService for DeliveryQueue {
    fn resend(&self, record: &MessageRecord) -> Result<(), DeliveryError> {
        info!("Queued resend of message {} in thread {}", record.id, record.thread_id);
        self.push(DeliveryRequest::Resend {
            message_id: record.id,
            thread_id: record.thread_id,
        })
    }
}

impl ReprocessQueue for DeliveryQueue {
    fn enqueue_reprocess(&self, message_id: MessageId) -> Result<(), DeliveryError> {
        info!("Queued reprocessing of message {}", message_id);
        self.push(DeliveryRequest::Reprocess { message_id })
    }
}

/// Delivery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery unavailable: {0}")]
    Unavailable(String),
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}
