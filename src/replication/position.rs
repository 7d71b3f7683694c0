//! Generation and Position types
//!
//! A Position names how much committed data has been accounted for:
//! `{generation, index, offset}`. Positions are totally ordered:
//! - generation first (newer generation is always greater)
//! - then WAL index within the generation
//! - then byte offset within that WAL
//!
//! Text form: `<generation>/<index:08x>:<offset:08x>`

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Index of the first WAL of every generation. The snapshot sits in front of it.
pub const FIRST_INDEX: u64 = 1;

/// Identifier of an unbroken lineage of changes rooted at one snapshot.
///
/// Backed by a UUID v7, so byte order equals creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(Uuid);

impl Generation {
    /// Create a new generation, ordered after every generation created before it
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for Generation {
    type Err = PositionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PositionParseError::new(format!("invalid generation: {}", raw)));
        }
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| PositionParseError::new(format!("invalid generation {}: {}", raw, e)))
    }
}

impl Serialize for Generation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Generation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A point in the replicated change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub generation: Generation,
    pub index: u64,
    pub offset: u64,
}

impl Position {
    pub const fn new(generation: Generation, index: u64, offset: u64) -> Self {
        Self {
            generation,
            index,
            offset,
        }
    }

    /// Position of a generation's snapshot: in front of the first WAL.
    pub const fn snapshot(generation: Generation) -> Self {
        Self::new(generation, FIRST_INDEX, 0)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.index.cmp(&other.index))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}:{:08x}", self.generation, self.index, self.offset)
    }
}

impl FromStr for Position {
    type Err = PositionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (generation, rest) = raw
            .split_once('/')
            .ok_or_else(|| PositionParseError::new(format!("invalid position: {}", raw)))?;
        let (index, offset) = rest
            .split_once(':')
            .ok_or_else(|| PositionParseError::new(format!("invalid position: {}", raw)))?;

        Ok(Self {
            generation: generation.parse()?,
            index: parse_hex(index, "index", raw)?,
            offset: parse_hex(offset, "offset", raw)?,
        })
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_hex(value: &str, component: &'static str, original: &str) -> Result<u64, PositionParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PositionParseError::new(format!(
            "invalid {} in position {}",
            component, original
        )));
    }
    u64::from_str_radix(value, 16).map_err(|_| {
        PositionParseError::new(format!("{} overflow in position {}", component, original))
    })
}

/// Error parsing a generation or position from text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PositionParseError {
    message: String,
}

impl PositionParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
