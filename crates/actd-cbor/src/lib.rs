//! Canonical CBOR encoding and SHA-256 digests for the activation log and snapshots.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_cbor::value::Value as CborValue;
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix for rendered digests (e.g. `sha256:deadbeef`).
pub const HASH_PREFIX: &str = "sha256:";

/// Serialize a value into canonical CBOR bytes.
///
/// Values are first lowered into `serde_cbor::Value`, whose map type is ordered,
/// so two equal values always encode to identical bytes regardless of the
/// iteration order of the source collections.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let canonical: CborValue = serde_cbor::value::to_value(value)?;
    let mut buf = Vec::with_capacity(256);
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical.serialize(&mut serializer)?;
    Ok(buf)
}

/// Decode a value previously written with [`to_canonical_cbor`].
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_cbor::Error> {
    serde_cbor::from_slice(bytes)
}

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Digest of a value's canonical CBOR encoding.
    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        Ok(Self::of_bytes(&to_canonical_cbor(value)?))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Hash(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as a `sha256:...` hex string.
    pub fn to_hex(&self) -> String {
        format!("{HASH_PREFIX}{}", hex::encode(self.0))
    }

    pub fn from_hex_str(s: &str) -> Result<Self, HashParseError> {
        let rest = s
            .strip_prefix(HASH_PREFIX)
            .ok_or(HashParseError::MissingPrefix)?;
        if rest.len() != 64 {
            return Err(HashParseError::InvalidLength(rest.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf).map_err(HashParseError::InvalidHex)?;
        Ok(Hash(buf))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash string missing '{HASH_PREFIX}' prefix")]
    MissingPrefix,
    #[error("hash hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn map_order_does_not_change_encoding() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for i in 0..32u32 {
            a.insert(format!("k{i}"), i);
        }
        for i in (0..32u32).rev() {
            b.insert(format!("k{i}"), i);
        }
        assert_eq!(to_canonical_cbor(&a).unwrap(), to_canonical_cbor(&b).unwrap());
        assert_eq!(Hash::of_cbor(&a).unwrap(), Hash::of_cbor(&b).unwrap());
    }

    #[test]
    fn hex_form_parses_back() {
        let text = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let hash = Hash::from_hex_str(text).unwrap();
        assert_eq!(hash.to_hex(), text);
        assert!(matches!(
            Hash::from_hex_str("0123"),
            Err(HashParseError::MissingPrefix)
        ));
        assert!(matches!(
            Hash::from_hex_str("sha256:0123"),
            Err(HashParseError::InvalidLength(4))
        ));
    }
}
