use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::deadline;
use crate::response::{CacheStatus, Response, ResponseBody};

/// Lifecycle of a key. "Absent" is not stored: it is the absence of a live
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// An execution is in flight.
    Started,
    /// A terminal response is cached.
    Finished,
}

impl IdempotencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown idempotency status {other:?}")),
        }
    }
}

/// One row of the idempotency table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    /// Set once finished.
    pub status_code: Option<u16>,
    /// Set once finished.
    pub response_body: Option<ResponseBody>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn started(key: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            status: IdempotencyStatus::Started,
            status_code: None,
            response_body: None,
            created_at: now,
            expires_at: deadline(now, ttl),
        }
    }

    /// Records are invisible strictly after `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_finished(&self) -> bool {
        self.status == IdempotencyStatus::Finished
    }

    /// The stored response, marked as a cache hit. `None` while in flight.
    pub fn cached_response(&self) -> Option<Response> {
        match (self.status, self.status_code, &self.response_body) {
            (IdempotencyStatus::Finished, Some(status), Some(body)) => Some(Response {
                status,
                body: body.clone(),
                cache: CacheStatus::Hit,
            }),
            _ => None,
        }
    }
}

/// Ownership of a key's Started record.
///
/// An expired claim can be replaced by a retry; the retry's row carries a
/// different `claimed_at`, so finishing or abandoning through the stale
/// claim leaves it alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub key: String,
    /// `created_at` of the claimed row, as the store persisted it.
    pub claimed_at: DateTime<Utc>,
}

impl IdempotencyClaim {
    pub fn of(record: &IdempotencyRecord) -> Self {
        Self {
            key: record.key.clone(),
            claimed_at: record.created_at,
        }
    }
}
