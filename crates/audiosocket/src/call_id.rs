//! Call identifiers
//!
//! A call identifier is a 128-bit value shared by the visitor and resident
//! legs of one conversation. On the wire it travels as the 16 raw bytes of
//! an ID frame; in logs, bus payloads and the management API it appears in
//! the canonical hyphenated 8-4-4-4-12 hex form. The wire byte order is the
//! UUID field order, so `bytes -> text -> bytes` is the identity.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{AudioSocketError, Result};

/// 128-bit identifier correlating the two legs of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(Uuid);

impl CallId {
    /// Generate a fresh identifier for an outbound intent.
    pub fn generate() -> Self {
        CallId(Uuid::new_v4())
    }

    /// Canonicalize the 16-byte payload of an inbound ID frame.
    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        if payload.len() != 16 {
            return Err(AudioSocketError::InvalidIdLength(payload.len()));
        }
        let mut raw = [0u8; 16];
        raw.copy_from_slice(payload);
        Ok(CallId(Uuid::from_bytes(raw)))
    }

    /// The 16-byte wire form, preserving the received byte order.
    pub fn to_wire(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Uuid renders the canonical hyphenated lowercase form.
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(CallId(Uuid::parse_str(s)?))
    }
}

impl serde::Serialize for CallId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for CallId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
