//! Responses produced by use cases and replayed from idempotency records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Response header telling the client whether the response was replayed.
pub const IDEMPOTENCY_CACHE_HEADER: &str = "X-Idempotency-Cache";

/// Whether a response was computed now or replayed from a finished record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStatus {
    #[default]
    Miss,
    Hit,
}

impl CacheStatus {
    /// Value for [`IDEMPOTENCY_CACHE_HEADER`].
    pub fn as_header_value(self) -> &'static str {
        match self {
            Self::Miss => "MISS",
            Self::Hit => "HIT",
        }
    }
}

/// Body of a response: a JSON payload or a redirect target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Payload { body: Value },
    Redirect { location: String },
}

impl ResponseBody {
    /// Flatten any serializable value to JSON.
    ///
    /// A value that fails to serialize becomes an empty (`null`) payload
    /// instead of failing the request.
    pub fn from_serializable(payload: &dyn erased_serde::Serialize) -> Self {
        let body = serde_json::to_value(payload).unwrap_or_else(|error| {
            warn!(%error, "response payload is not serializable, storing empty body");
            Value::Null
        });
        Self::Payload { body }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: ResponseBody,
    pub cache: CacheStatus,
}

impl Response {
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        Self::with_status(200, payload)
    }

    pub fn created<T: Serialize>(payload: &T) -> Self {
        Self::with_status(201, payload)
    }

    pub fn with_status<T: Serialize>(status: u16, payload: &T) -> Self {
        Self {
            status,
            body: ResponseBody::from_serializable(payload),
            cache: CacheStatus::Miss,
        }
    }

    /// `303 See Other` to `location`, the usual answer to a form POST.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: 303,
            body: ResponseBody::Redirect {
                location: location.into(),
            },
            cache: CacheStatus::Miss,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Payload { body } => Some(body),
            ResponseBody::Redirect { .. } => None,
        }
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Redirect { location } => Some(location),
            ResponseBody::Payload { .. } => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.cache == CacheStatus::Hit
    }
}
