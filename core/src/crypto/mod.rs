//! Key material and key-exchange envelopes
//!
//! Provides:
//! - Identity key encoding and fingerprints
//! - Decoding of the three key-exchange envelope variants

pub mod keys;
pub mod envelope;

pub use keys::{IdentityKey, IdentityKeyPair, KeyError};
pub use envelope::{
    decode, EnvelopeError, EnvelopeKind, KeyExchangeEnvelope, KeyExchangeMessage,
    PreKeyBundleMessage,
};
