//! # Tracker Identifier Types
//!
//! Identifier newtypes shared by every tracker component.
//!
//! ## Types
//!
//! | Type | Description | Representation |
//! |------|-------------|----------------|
//! | `NodeId` | Provider or client identity, from its public key | 32 bytes, hex on the wire |
//! | `FileId` | Row id of a content-addressed File | u64 |
//! | `OwnerId` | Row id of a FileOwner tree entry | u64 |
//! | `TaskId` | Row id of a repair/prove Task | u64 |
//! | `Timestamp` | Unix timestamp in seconds | u64 |
//! | `Day` | Days since the Unix epoch (UTC) | u64 |
//!
//! `NodeId` orders by its raw bytes, which gives the provider snapshot a
//! stable order independent of registration time.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Day index counted from the Unix epoch.
pub type Day = u64;

/// Seconds in one UTC day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Day that contains `ts`.
#[inline]
pub fn day_of(ts: Timestamp) -> Day {
    ts / SECS_PER_DAY
}

/// Current wall-clock time as a Unix timestamp. Saturates to 0 before the epoch.
pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// First second of `day`.
#[inline]
pub fn day_start(day: Day) -> Timestamp {
    day.saturating_mul(SECS_PER_DAY)
}

/// First second after `day` (exclusive end).
#[inline]
pub fn day_end(day: Day) -> Timestamp {
    day_start(day).saturating_add(SECS_PER_DAY)
}

// ════════════════════════════════════════════════════════════════════════════════
// PARSE ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Error returned when a hex identifier cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Hex string has the wrong number of characters.
    #[error("invalid hex length: got {got} characters, expected {expected}")]
    InvalidLength { got: usize, expected: usize },

    /// Hex string contains a non-hex character.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE ID
// ════════════════════════════════════════════════════════════════════════════════

/// Stable identity of a provider or client.
///
/// Derived as SHA3-256 of the node's public key, so the same key always
/// maps to the same id. Serialized as a 64-character lowercase hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Wraps raw id bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives the id of the node owning `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha3_256::digest(public_key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the 64-character hex form (either case).
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        if s.len() != 64 {
            return Err(ParseError::InvalidLength {
                got: s.len(),
                expected: 64,
            });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(12);
        s
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for NodeId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        NodeId::from_hex(&s)
    }
}

impl std::str::FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::from_hex(s)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// ROW IDS
// ════════════════════════════════════════════════════════════════════════════════

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Row id of a File.
    FileId
);
row_id!(
    /// Row id of a FileOwner entry (folder or file).
    OwnerId
);
row_id!(
    /// Row id of a Task.
    TaskId
);
