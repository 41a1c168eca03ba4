//! Hex serialization helpers for serde
use serde::Deserialize;

/// Identity keys are stored as the hex of their 33-byte wire encoding,
/// so stored documents can be compared against envelopes by eye.
pub mod identity_key {
    use super::*;
    use crate::crypto::keys::DJB_TYPE;

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut encoded = Vec::with_capacity(33);
        encoded.push(DJB_TYPE);
        encoded.extend_from_slice(key);
        serializer.serialize_str(&hex::encode(encoded))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        match bytes.split_first() {
            Some((&DJB_TYPE, rest)) => rest
                .try_into()
                .map_err(|_| serde::de::Error::custom("Invalid length")),
            Some((other, _)) => Err(serde::de::Error::custom(format!(
                "Unknown key type: {:#04x}",
                other
            ))),
            None => Err(serde::de::Error::custom("Empty key")),
        }
    }
}
