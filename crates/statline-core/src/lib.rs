pub mod sync_ipc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub type CategoryId = i64;

/// 2100-01-01T00:00:00Z. Millisecond timestamps land far above this.
pub const MAX_EPOCH_SECONDS: i64 = 4_102_444_800;

/// A single timestamped activity event as delivered by the sync source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(deserialize_with = "deserialize_key")]
    pub primary_key: String,
    pub category_id: CategoryId,
    /// Epoch seconds, UTC.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    pub fn new(
        primary_key: impl Into<String>,
        category_id: CategoryId,
        timestamp: i64,
        payload: Value,
    ) -> Self {
        Self {
            primary_key: primary_key.into(),
            category_id,
            timestamp,
            payload,
        }
    }

    /// True when `timestamp` reads as epoch seconds between 1970 and 2100.
    pub fn has_epoch_seconds(&self) -> bool {
        (0..MAX_EPOCH_SECONDS).contains(&self.timestamp)
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("invalid range: from {from} is after to {to}")]
    Inverted { from: i64, to: i64 },
}

/// A client-issued request for the records in `[range_from, range_to]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub correlation_id: String,
    pub range_from: i64,
    pub range_to: i64,
}

impl SyncRequest {
    pub fn new(range_from: i64, range_to: i64) -> Result<Self, RangeError> {
        if range_from > range_to {
            return Err(RangeError::Inverted {
                from: range_from,
                to: range_to,
            });
        }
        Ok(Self {
            correlation_id: new_correlation_id(),
            range_from,
            range_to,
        })
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoryScope {
    #[default]
    All,
    Only(Vec<CategoryId>),
}

impl CategoryScope {
    pub fn only(ids: impl IntoIterator<Item = CategoryId>) -> Self {
        let mut ids = ids.into_iter().collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            Self::All
        } else {
            Self::Only(ids)
        }
    }

    pub fn categories(&self) -> Option<&[CategoryId]> {
        match self {
            CategoryScope::All => None,
            CategoryScope::Only(ids) => Some(ids),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    AwaitingStart,
    Receiving,
    Done,
    Failed,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::AwaitingStart => "awaiting_start",
            SyncState::Receiving => "receiving",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary keys arrive as strings from most sources but some emit integers.
fn deserialize_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected string or number for primaryKey",
        )),
    }
}
