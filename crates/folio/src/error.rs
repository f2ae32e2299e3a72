//! Error types for the command pipeline.
//!
//! Use cases and middleware speak `anyhow::Result`. The pipeline boundary
//! folds whatever comes back into a [`PipelineError`], so callers branch on a
//! small closed set of variants (and on [`ApplicationError::code`]) instead
//! of on concrete domain error types.

use crate::content::StoreError;

/// Errors raised by use cases for invalid input or violated business rules.
///
/// These are the only errors the pipeline re-wraps; everything else passes
/// through as infrastructure failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Input failed validation, optionally tied to a single field.
    #[error("validation failed [{code}]: {message}")]
    Validation {
        code: String,
        field: Option<String>,
        message: String,
    },

    /// The request was well-formed but a business rule rejected it.
    #[error("business rule violated [{code}]: {message}")]
    BusinessRule { code: String, message: String },
}

impl DomainError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            field: None,
            message: message.into(),
        }
    }

    pub fn field(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            code: code.into(),
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn business_rule(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Uniform envelope for domain failures surfaced by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ApplicationError {
    pub code: String,
    pub field: Option<String>,
    pub message: String,
}

impl From<DomainError> for ApplicationError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Validation {
                code,
                field,
                message,
            } => Self {
                code,
                field,
                message,
            },
            DomainError::BusinessRule { code, message } => Self {
                code,
                field: None,
                message,
            },
        }
    }
}

/// Error returned by [`Pipeline::execute`](crate::Pipeline::execute).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A domain failure from the use case, normalized.
    #[error("application error: {0}")]
    Application(ApplicationError),

    /// Another execution for the same idempotency key is in flight.
    #[error("idempotency key {key} is being processed by another request")]
    Contention { key: String },

    /// Writing uploaded content failed.
    #[error(transparent)]
    Storage(StoreError),

    /// Lock service, database or any other infrastructure failure.
    #[error(transparent)]
    Infrastructure(anyhow::Error),
}

impl PipelineError {
    /// Fold an error from the middleware chain into a pipeline error.
    ///
    /// Context added with `anyhow::Context` does not hide the underlying
    /// domain error.
    pub fn normalize(error: anyhow::Error) -> Self {
        let error = match error.downcast::<DomainError>() {
            Ok(domain) => return Self::Application(domain.into()),
            Err(error) => error,
        };
        let error = match error.downcast::<PipelineError>() {
            Ok(pipeline) => return pipeline,
            Err(error) => error,
        };
        match error.downcast::<StoreError>() {
            Ok(store) => Self::Storage(store),
            Err(error) => Self::Infrastructure(error),
        }
    }

    /// Error code for application errors, `None` otherwise.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Application(error) => Some(&error.code),
            _ => None,
        }
    }

    /// HTTP status an outer filter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Application(_) => 422,
            Self::Contention { .. } => 409,
            Self::Storage(_) | Self::Infrastructure(_) => 500,
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

/// Errors from the idempotency coordinator's own bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// `save_response` was called for a key that has no in-flight record.
    #[error("idempotency key {key} has no in-flight record to finish")]
    NotStarted { key: String },

    /// A stored row could not be decoded.
    #[error("idempotency record for {key} is corrupt: {reason}")]
    CorruptRecord { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn validation_errors_normalize_to_application_error() {
        let err = anyhow::Error::new(DomainError::field("title", "title.blank", "title is required"));

        let normalized = PipelineError::normalize(err);

        match normalized {
            PipelineError::Application(app) => {
                assert_eq!(app.code, "title.blank");
                assert_eq!(app.field.as_deref(), Some("title"));
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[test]
    fn context_does_not_hide_domain_errors() {
        let err: anyhow::Result<()> =
            Err(DomainError::business_rule("book.already_published", "already published").into());
        let err = err.context("publishing book").unwrap_err();

        let normalized = PipelineError::normalize(err);

        assert_eq!(normalized.code(), Some("book.already_published"));
        assert_eq!(normalized.status_code(), 422);
    }

    #[test]
    fn contention_passes_through() {
        let err = anyhow::Error::new(PipelineError::Contention { key: "k1".into() });

        let normalized = PipelineError::normalize(err);

        assert!(normalized.is_contention());
        assert_eq!(normalized.status_code(), 409);
    }

    #[test]
    fn unknown_errors_are_infrastructure() {
        let normalized = PipelineError::normalize(anyhow::anyhow!("connection reset"));

        assert!(matches!(normalized, PipelineError::Infrastructure(_)));
        assert_eq!(normalized.code(), None);
        assert_eq!(normalized.status_code(), 500);
    }
}
