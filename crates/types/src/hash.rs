//! SHA-256 digest type with a hex wire representation.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest.
///
/// Serialized as a 64-character lowercase hex string so the wire format and
/// the log output stay human-readable. Ordering is lexicographic over the
/// raw bytes, which matches the ordering of the hex encoding and is used by
/// fork-choice tie breaking.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero digest, used as the genesis parent.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }

    /// Whether the hex encoding starts with at least `difficulty` `'0'`
    /// nibbles. This is the proof-of-work target predicate.
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        let mut remaining = difficulty;
        for byte in self.0.iter() {
            if remaining == 0 {
                return true;
            }
            if byte >> 4 != 0 {
                return false;
            }
            remaining -= 1;
            if remaining == 0 {
                return true;
            }
            if byte & 0x0f != 0 {
                return false;
            }
            remaining -= 1;
        }
        remaining == 0
    }

    /// Short prefix for diagnostics.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", self.short())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(|e| de::Error::custom(format!("invalid hash: {e}")))
    }
}
