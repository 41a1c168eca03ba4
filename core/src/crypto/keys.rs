//! Identity key types
//!
//! An identity key travels in a fixed 33-byte encoding: a key type byte
//! followed by the 32-byte Curve25519 public key.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Key type byte for Curve25519 public keys
pub const DJB_TYPE: u8 = 0x05;

/// Length of a serialized identity key
pub const IDENTITY_KEY_LEN: usize = 33;

/// Long-term public key of a recipient's device.
///
/// Two keys are the same key iff their encodings are byte-identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(#[serde(with = "crate::util::serde_hex::identity_key")] [u8; 32]);

impl IdentityKey {
    /// Wrap raw Curve25519 public key bytes
    pub fn from_public_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a serialized identity key starting at `offset`
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<Self, KeyError> {
        let end = offset
            .checked_add(IDENTITY_KEY_LEN)
            .ok_or(KeyError::InvalidFormat)?;
        let encoded = bytes.get(offset..end).ok_or(KeyError::InvalidFormat)?;

        if encoded[0] != DJB_TYPE {
            return Err(KeyError::BadKeyType(encoded[0]));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&encoded[1..]);
        Ok(Self(key))
    }

    /// Serialize to the 33-byte wire encoding
    pub fn serialize(&self) -> [u8; IDENTITY_KEY_LEN] {
        let mut out = [0u8; IDENTITY_KEY_LEN];
        out[0] = DJB_TYPE;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Raw public key bytes (without the type byte)
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Human-readable fingerprint for comparing keys out of band
    ///
    /// Truncated SHA-256 of the encoding, formatted as groups of 4 hex chars.
    /// Example: "A1B2-C3D4-E5F6-0718"
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.serialize());
        let hex_str = hex::encode_upper(&hash[..8]);

        hex_str
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// Identity key pair for the local device
#[derive(Clone)]
pub struct IdentityKeyPair {
    private_key: StaticSecret,
    public_key: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);

        Self {
            private_key,
            public_key,
        }
    }

    /// Public half as an identity key
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey(self.public_key.to_bytes())
    }

    /// Serialize the private key (for storage)
    pub fn to_bytes(&self) -> [u8; 32] {
        self.private_key.to_bytes()
    }

    /// Restore from a stored private key
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let private_key = StaticSecret::from(bytes);
        let public_key = X25519PublicKey::from(&private_key);

        Self {
            private_key,
            public_key,
        }
    }
}

/// Key-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Unknown key type: {0:#04x}")]
    BadKeyType(u8),
}
