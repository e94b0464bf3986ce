//! # Domain Types
//!
//! Core types for the log-projected key–value model: sequence numbers,
//! events, per-key metadata, and records.
//!
//! ## Invariants
//!
//! - [`Seq`]: assigned by the log, strictly increasing within a stream;
//!   zero means "nothing published / nothing applied".
//! - [`Event`]: immutable once published; `old_data` is attached by the
//!   projector at application time and never travels on the wire.
//! - [`MetaData`]: describes the most recent PUT for a key in the applied
//!   prefix, or is absent iff the last applied event for the key was a
//!   DELETE.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

// =============================================================================
// Sequence Numbers
// =============================================================================

/// A sequence number assigned by the log.
///
/// Sequences totally order all events within one stream. `Seq(0)` is the
/// sentinel for "empty stream" and "no checkpoint"; the first published
/// event is assigned 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Seq(u64);

impl Seq {
    /// The sentinel sequence: nothing published, nothing applied.
    pub const ZERO: Seq = Seq(0);

    /// Creates a `Seq` from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence.
    pub fn next(&self) -> Seq {
        Seq(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// The kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single record in the log describing a mutation.
///
/// Wire shape (JSON): `{"type":"PUT"|"DELETE","id":...,"data":...?,"timestamp":...}`.
/// `data` is present for PUT only. `old_data` is populated by the projector
/// with the prior projected value (for subscriber callbacks) and is never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Mutation kind.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// The user key. Any UTF-8 string, including separators and whitespace.
    pub id: String,

    /// The user payload; `None` for DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,

    /// Prior projected value, attached at projection time. Never on the wire.
    #[serde(skip)]
    pub old_data: Option<JsonValue>,

    /// Producer wall clock, milliseconds since epoch.
    pub timestamp: i64,
}

impl Event {
    /// Creates a PUT event stamped with the current wall clock.
    pub fn put(id: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: EventKind::Put,
            id: id.into(),
            data: Some(data),
            old_data: None,
            timestamp: now_ms(),
        }
    }

    /// Creates a DELETE event stamped with the current wall clock.
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            id: id.into(),
            data: None,
            old_data: None,
            timestamp: now_ms(),
        }
    }

    /// Serializes the wire payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a wire payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Metadata and Records
// =============================================================================

/// Per-key bookkeeping, maintained by the projector.
///
/// A key's lineage begins at its first PUT (or the first PUT after a
/// DELETE). Timestamps are the log-assigned event times, formatted as
/// ISO-8601 with millisecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    /// When the first PUT of the current lineage was logged.
    pub date_created: String,

    /// When the most recent PUT was logged.
    pub date_modified: String,

    /// Applied PUT count for the current lineage. Always ≥ 1.
    pub changes: u64,
}

impl MetaData {
    /// Metadata for a key that just came into existence.
    pub fn created(time_ms: i64) -> Self {
        let stamp = iso_millis(time_ms);
        Self {
            date_created: stamp.clone(),
            date_modified: stamp,
            changes: 1,
        }
    }

    /// Metadata after another PUT was applied to an existing key.
    pub fn touched(&self, time_ms: i64) -> Self {
        Self {
            date_created: self.date_created.clone(),
            date_modified: iso_millis(time_ms),
            changes: self.changes + 1,
        }
    }
}

/// A live key's projected state: metadata plus the stored document.
///
/// The document always carries its own key under the `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub meta: MetaData,
    pub data: JsonValue,
}

// =============================================================================
// Clock Helpers
// =============================================================================

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Formats epoch milliseconds as ISO-8601 (`2024-01-15T09:30:00.123Z`).
pub fn iso_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Tests
// =============================================================================
