//! Key-exchange envelope decoding
//!
//! Incoming key-exchange messages arrive as base64 bodies tagged with the
//! kind of envelope they carry. The kind is decided by the flags the message
//! was stored with, never by sniffing the payload.
//!
//! Wire layouts (integers little-endian, keys in their 33-byte encoding):
//!
//! ```text
//! PreKeyBundle:  [version][registration_id u32][has_prekey u8][prekey_id u32]?
//!                [signed_prekey_id u32][base_key][identity_key][len u32][message]
//! PlainExchange: [version][sequence u32][flags u8][base_key][ratchet_key]
//!                [identity_key][base_key_signature 64]
//! ```
//!
//! The version byte carries the message version in its high nibble and the
//! sender's highest supported version in its low nibble.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{IdentityKey, KeyError, IDENTITY_KEY_LEN};

/// Current message version
pub const CURRENT_VERSION: u8 = 3;

/// Oldest version still accepted; anything below is legacy
pub const MIN_SUPPORTED_VERSION: u8 = 2;

/// Bodies are written without padding but accepted either way.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SIGNATURE_LEN: usize = 64;

/// Which envelope variant a stored key-exchange message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Raw identity key bytes announcing new key material
    IdentityUpdate,
    /// Pre-key bundle handshake message
    PreKeyBundle,
    /// Bare key-exchange handshake message
    PlainExchange,
}

impl EnvelopeKind {
    /// Select the variant from the flags a message was tagged with.
    /// The bundle flag wins over the identity-update flag.
    pub fn from_flags(is_bundle: bool, is_identity_update: bool) -> Self {
        if is_bundle {
            EnvelopeKind::PreKeyBundle
        } else if is_identity_update {
            EnvelopeKind::IdentityUpdate
        } else {
            EnvelopeKind::PlainExchange
        }
    }
}

/// Pre-key bundle handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundleMessage {
    pub version: u8,
    pub registration_id: u32,
    pub prekey_id: Option<u32>,
    pub signed_prekey_id: u32,
    pub base_key: IdentityKey,
    pub identity_key: IdentityKey,
    /// Inner ratchet message, opaque here
    pub message: Vec<u8>,
}

impl PreKeyBundleMessage {
    pub fn new(
        registration_id: u32,
        prekey_id: Option<u32>,
        signed_prekey_id: u32,
        base_key: IdentityKey,
        identity_key: IdentityKey,
        message: Vec<u8>,
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            registration_id,
            prekey_id,
            signed_prekey_id,
            base_key,
            identity_key,
            message,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut reader = WireReader::new(bytes);
        let version = reader.version()?;
        let registration_id = reader.u32()?;
        let prekey_id = match reader.u8()? {
            0 => None,
            _ => Some(reader.u32()?),
        };
        let signed_prekey_id = reader.u32()?;
        let base_key = reader.key()?;
        let identity_key = reader.key()?;
        let len = reader.u32()? as usize;
        let message = reader.take(len)?.to_vec();
        reader.finish()?;

        Ok(Self {
            version,
            registration_id,
            prekey_id,
            signed_prekey_id,
            base_key,
            identity_key,
            message,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(86 + self.message.len());
        out.push(version_byte(self.version));
        out.extend_from_slice(&self.registration_id.to_le_bytes());
        match self.prekey_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.signed_prekey_id.to_le_bytes());
        out.extend_from_slice(&self.base_key.serialize());
        out.extend_from_slice(&self.identity_key.serialize());
        out.extend_from_slice(&(self.message.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.message);
        out
    }
}

/// Bare key-exchange handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeMessage {
    pub version: u8,
    pub sequence: u32,
    pub flags: u8,
    pub base_key: IdentityKey,
    pub ratchet_key: IdentityKey,
    pub identity_key: IdentityKey,
    /// Signature over the base key; verified by the session layer, not here
    pub base_key_signature: [u8; SIGNATURE_LEN],
}

impl KeyExchangeMessage {
    pub fn new(
        sequence: u32,
        flags: u8,
        base_key: IdentityKey,
        ratchet_key: IdentityKey,
        identity_key: IdentityKey,
        base_key_signature: [u8; SIGNATURE_LEN],
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            sequence,
            flags,
            base_key,
            ratchet_key,
            identity_key,
            base_key_signature,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut reader = WireReader::new(bytes);
        let version = reader.version()?;
        let sequence = reader.u32()?;
        let flags = reader.u8()?;
        let base_key = reader.key()?;
        let ratchet_key = reader.key()?;
        let identity_key = reader.key()?;
        let mut base_key_signature = [0u8; SIGNATURE_LEN];
        base_key_signature.copy_from_slice(reader.take(SIGNATURE_LEN)?);
        reader.finish()?;

        Ok(Self {
            version,
            sequence,
            flags,
            base_key,
            ratchet_key,
            identity_key,
            base_key_signature,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 3 * IDENTITY_KEY_LEN + SIGNATURE_LEN);
        out.push(version_byte(self.version));
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.flags);
        out.extend_from_slice(&self.base_key.serialize());
        out.extend_from_slice(&self.ratchet_key.serialize());
        out.extend_from_slice(&self.identity_key.serialize());
        out.extend_from_slice(&self.base_key_signature);
        out
    }
}

/// A decoded key-exchange payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExchangeEnvelope {
    IdentityUpdate(IdentityKey),
    PreKeyBundle(PreKeyBundleMessage),
    PlainExchange(KeyExchangeMessage),
}

impl KeyExchangeEnvelope {
    /// Parse a base64 body as the given kind of envelope
    pub fn parse(raw_body: &str, kind: EnvelopeKind) -> Result<Self, EnvelopeError> {
        let bytes = BODY_ENGINE
            .decode(raw_body.trim())
            .map_err(|e| EnvelopeError::InvalidBase64(e.to_string()))?;

        match kind {
            EnvelopeKind::IdentityUpdate => {
                let key = IdentityKey::from_bytes(&bytes, 0).map_err(|e| match e {
                    KeyError::InvalidFormat => EnvelopeError::Truncated,
                    other => EnvelopeError::InvalidKey(other),
                })?;
                if bytes.len() > IDENTITY_KEY_LEN {
                    return Err(EnvelopeError::TrailingBytes(bytes.len() - IDENTITY_KEY_LEN));
                }
                Ok(KeyExchangeEnvelope::IdentityUpdate(key))
            }
            EnvelopeKind::PreKeyBundle => {
                PreKeyBundleMessage::decode(&bytes).map(KeyExchangeEnvelope::PreKeyBundle)
            }
            EnvelopeKind::PlainExchange => {
                KeyExchangeMessage::decode(&bytes).map(KeyExchangeEnvelope::PlainExchange)
            }
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            KeyExchangeEnvelope::IdentityUpdate(_) => EnvelopeKind::IdentityUpdate,
            KeyExchangeEnvelope::PreKeyBundle(_) => EnvelopeKind::PreKeyBundle,
            KeyExchangeEnvelope::PlainExchange(_) => EnvelopeKind::PlainExchange,
        }
    }

    /// The identity key the envelope carries
    pub fn identity_key(&self) -> IdentityKey {
        match self {
            KeyExchangeEnvelope::IdentityUpdate(key) => *key,
            KeyExchangeEnvelope::PreKeyBundle(msg) => msg.identity_key,
            KeyExchangeEnvelope::PlainExchange(msg) => msg.identity_key,
        }
    }

    /// Encode to the base64 body form stored with the message
    pub fn to_body(&self) -> String {
        let bytes = match self {
            KeyExchangeEnvelope::IdentityUpdate(key) => key.serialize().to_vec(),
            KeyExchangeEnvelope::PreKeyBundle(msg) => msg.encode(),
            KeyExchangeEnvelope::PlainExchange(msg) => msg.encode(),
        };
        BODY_ENGINE.encode(bytes)
    }
}

/// Extract the identity key from a stored key-exchange body
pub fn decode(raw_body: &str, kind: EnvelopeKind) -> Result<IdentityKey, EnvelopeError> {
    KeyExchangeEnvelope::parse(raw_body, kind).map(|envelope| envelope.identity_key())
}

fn version_byte(version: u8) -> u8 {
    (version << 4) | CURRENT_VERSION
}

/// Cursor over a decoded envelope
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(len).ok_or(EnvelopeError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(EnvelopeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn key(&mut self) -> Result<IdentityKey, EnvelopeError> {
        let raw = self.take(IDENTITY_KEY_LEN)?;
        IdentityKey::from_bytes(raw, 0).map_err(EnvelopeError::InvalidKey)
    }

    fn version(&mut self) -> Result<u8, EnvelopeError> {
        let byte = self.u8()?;
        let message_version = byte >> 4;
        let sender_current = byte & 0x0F;

        if message_version < MIN_SUPPORTED_VERSION {
            return Err(EnvelopeError::Legacy(message_version));
        }
        if message_version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(message_version));
        }
        if sender_current < message_version {
            return Err(EnvelopeError::InvalidVersion(byte));
        }
        Ok(message_version)
    }

    fn finish(self) -> Result<(), EnvelopeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(EnvelopeError::TrailingBytes(extra)),
        }
    }
}

/// Malformed envelope errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: invalid base64 ({0})")]
    InvalidBase64(String),
    #[error("Malformed envelope: truncated message")]
    Truncated,
    #[error("Malformed envelope: bad version byte {0:#04x}")]
    InvalidVersion(u8),
    #[error("Malformed envelope: legacy message version {0}")]
    Legacy(u8),
    #[error("Malformed envelope: unsupported message version {0}")]
    UnsupportedVersion(u8),
    #[error("Malformed envelope: {0}")]
    InvalidKey(KeyError),
    #[error("Malformed envelope: {0} trailing bytes")]
    TrailingBytes(usize),
}
