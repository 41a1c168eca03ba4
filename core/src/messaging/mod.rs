//! Message records and the per-thread mismatch index

pub mod record;
pub mod index;

pub use record::{
    DeliveryStatus, Destination, Direction, MessageId, MessageRecord, ProcessingState, ThreadId,
};
pub use index::{IndexError, MismatchIndex, PendingMismatches};
