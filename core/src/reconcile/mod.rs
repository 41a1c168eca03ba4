//! Reconciliation after an operator accepts a changed identity key
//!
//! Provides:
//! - The acceptance state machine and per-record reconciliation
//! - Background scheduling with coalescing of equivalent requests
//! - The delegated resend and reprocess collaborators

pub mod delivery;
pub mod engine;
pub mod task;

pub use delivery::{DeliveryError, DeliveryQueue, DeliveryRequest, ReprocessQueue, ResendService};
pub use engine::{
    ReconcileError, ReconcileOutcome, ReconcileReport, ReconcileState, ReconciliationEngine,
    RecordAction,
};
pub use task::{ReconcileCallback, ReconcileHandle, ReconcileScheduler};

#[cfg(test)]
mod tests;
