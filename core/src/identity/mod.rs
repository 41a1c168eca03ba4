//! Identity trust
//!
//! Provides:
//! - The durable trust table and its accept path
//! - Trust evaluation and mismatch detection for candidate keys

pub mod record;
pub mod mismatch;
pub mod store;
pub mod trust;

pub use record::{IdentityRecord, RecipientId, TrustState};
pub use mismatch::{IdentityKeyMismatch, MismatchKey};
pub use store::{IdentityError, IdentityStore};
pub use trust::{TrustCheck, TrustEvaluator};
