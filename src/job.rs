//! Job record definition and canonical codec.
//!
//! This module defines the wire format stored in Redis lists: a JSON object
//! with a fixed set of known fields plus a catch-all for anything else, so
//! unknown fields written by a newer producer round-trip through an older
//! worker unchanged (spec §3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Priority class a job belongs to.
///
/// Only "high" and "low" are named by the spec, but the set is configured
/// (`Config::priorities`), so this type accepts arbitrary interned names
/// rather than being a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub String);

impl Priority {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn high() -> Self {
        Self::new("high")
    }

    pub fn low() -> Self {
        Self::new("low")
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Priority {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A job record as stored in a priority queue, processing list, or DLQ.
///
/// Fields beyond the ones named in the spec are preserved via `extra` so a
/// job produced by a newer version of this crate (or an entirely different
/// producer) round-trips through `decode(encode(record)) == record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque, unique job id.
    pub id: String,
    /// Producer-chosen payload (a file path for the reference producer).
    pub payload: String,
    /// Size hint used for scheduling/priority classification.
    pub size: u64,
    /// Priority class; determines which queue the job lives on.
    pub priority: Priority,
    /// Number of times this job has been attempted and failed.
    #[serde(default)]
    pub retries: u32,
    /// Creation timestamp, RFC3339 with nanosecond precision, UTC.
    pub creation_time: DateTime<Utc>,
    /// Optional distributed-tracing correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Optional distributed-tracing span id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// Number of times this job has been reaped (not a failure, see §4.4).
    #[serde(default)]
    pub reap_count: u32,
    /// The error string from the most recent failed attempt, if any.
    /// Surfaced by DLQ listing so an operator doesn't have to correlate
    /// against worker logs (spec §7 "user-visible behavior").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Timestamp of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    /// Any fields not named above, preserved verbatim across encode/decode.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobRecord {
    /// Creates a new job record with the given payload and priority.
    pub fn new(payload: impl Into<String>, size: u64, priority: Priority) -> Self {
        Self {
            id: crate::ids::new_job_id(),
            payload: payload.into(),
            size,
            priority,
            retries: 0,
            creation_time: Utc::now(),
            trace_id: None,
            span_id: None,
            reap_count: 0,
            last_error: None,
            last_attempt_time: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    /// Whether the job is eligible for another attempt given `max_retries`.
    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.retries < max_retries
    }
}

/// Errors raised by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record of {size} bytes exceeds MaxJobBytes ({max})")]
    TooLarge { size: usize, max: usize },

    #[error("failed to serialize job record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Canonical JSON codec for [`JobRecord`].
///
/// Serialization is deterministic for a given record (`serde_json` preserves
/// struct field declaration order, and `extra` is a `BTreeMap` so flattened
/// keys sort stably) so the stored string can be used as the exact-match
/// argument to `LREM`.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_job_bytes: usize,
}

impl Codec {
    pub fn new(max_job_bytes: usize) -> Self {
        Self { max_job_bytes }
    }

    /// Encodes a record to its canonical JSON string, rejecting it if it
    /// exceeds `MaxJobBytes`.
    pub fn encode(&self, record: &JobRecord) -> Result<String, CodecError> {
        let encoded = serde_json::to_string(record)?;
        if encoded.len() > self.max_job_bytes {
            return Err(CodecError::TooLarge {
                size: encoded.len(),
                max: self.max_job_bytes,
            });
        }
        Ok(encoded)
    }

    /// Decodes a record from its canonical JSON string.
    pub fn decode(&self, raw: &str) -> Result<JobRecord, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}
