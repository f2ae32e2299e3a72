//! # Folio
//!
//! The command-execution core behind the catalog's write endpoints. Every
//! state-changing operation is a [`Command`] handed to a [`UseCase`] through a
//! [`Pipeline`] of middleware.
//!
//! ## Core Concepts
//!
//! - [`Command`] = plain request data, optionally carrying an idempotency key
//!   and an [`Upload`]
//! - [`UseCase`] = the business operation; returns a [`Response`] or an error
//! - [`Middleware`] = one layer of the onion; calls [`Next::run`] to continue
//!
//! The key principle: **one key = one execution = one response**. A client may
//! retry a keyed command as often as it likes; the use case runs at most once
//! and every retry receives the same recorded response.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline.execute(command, use_case)
//!     │
//!     ▼
//! IdempotencyMiddleware ── Finished record? ──► cached Response (HIT)
//!     │  lock "idempotency:<key>", start_request
//!     ▼
//! FileLifecycleMiddleware ── save upload ──► ContentStore
//!     │
//!     ▼
//! TransactionMiddleware ── begin ──► Context.transaction
//!     │
//!     ▼
//! UseCase.execute() ── publish_after_commit ──► TransactionHandle
//!     │
//!     ▲ Ok: commit, then after-commit callbacks in order
//!     ▲ Err: rollback, delete new upload, drop the Started claim
//!     │
//! save_response, release lock ──► Response (MISS)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one record per key** - enforced by the store, not by reads
//! 2. **Started → Finished happens once** - finished records are never rewritten
//! 3. **Expired records are absent** - expiry is evaluated on read
//! 4. **Events follow commit** - rollback discards them, delivery keeps order
//! 5. **Content is immutable** - a key is the SHA-256 of its bytes
//! 6. **Locks are always released** - including when the use case panics
//!
//! ## Example
//!
//! ```ignore
//! use folio_core::{
//!     async_trait, idempotency_key_field, Command, Context, IdempotencyConfig,
//!     IdempotencyCoordinator, IdempotencyMiddleware, LocalLock, MemoryIdempotencyStore,
//!     Pipeline, Response, UseCase,
//! };
//! use std::sync::Arc;
//!
//! struct CreateBook {
//!     idempotency_key: String,
//!     title: String,
//! }
//!
//! impl Command for CreateBook {
//!     idempotency_key_field!(idempotency_key);
//! }
//!
//! struct CreateBookUseCase;
//!
//! #[async_trait]
//! impl UseCase<CreateBook> for CreateBookUseCase {
//!     async fn execute(&self, cmd: CreateBook, ctx: &mut Context) -> anyhow::Result<Response> {
//!         Ok(Response::created(&serde_json::json!({ "title": cmd.title })))
//!     }
//! }
//!
//! let coordinator = IdempotencyCoordinator::new(
//!     Arc::new(MemoryIdempotencyStore::new()),
//!     Arc::new(LocalLock::new()),
//! );
//! let pipeline = Pipeline::new()
//!     .pipe(IdempotencyMiddleware::new(coordinator, IdempotencyConfig::default()));
//!
//! let response = pipeline.execute(command, &CreateBookUseCase).await?;
//! ```

mod clock;
mod command;
mod command_macro;
mod config;
mod error;
mod lock;
mod pipeline;
mod response;
mod transaction;

pub mod content;
pub mod idempotency;
pub mod maintenance;


// Re-export command types
pub use command::{Command, Upload};

// Re-export pipeline types
pub use pipeline::{Context, Middleware, Next, Pipeline, UseCase};

// Re-export error types
pub use error::{ApplicationError, DomainError, IdempotencyError, PipelineError};

// Re-export response types
pub use response::{
    CacheStatus, Response, ResponseBody, IDEMPOTENCY_CACHE_HEADER, IDEMPOTENCY_KEY_HEADER,
};

// Re-export transaction types
pub use transaction::{
    CommitError, Transaction, TransactionHandle, TransactionManager, TransactionMiddleware,
};

// Re-export idempotency entry points
pub use idempotency::{
    IdempotencyCoordinator, IdempotencyMiddleware, IdempotencyStore, MemoryIdempotencyStore,
};

// Re-export content entry points
pub use content::{ContentKey, ContentStore, FileLifecycleMiddleware, FsContentStore};

pub use clock::{Clock, SystemClock};
pub use config::{ContentStoreConfig, IdempotencyConfig};
pub use lock::{LocalLock, Lock};

// Re-export commonly used external types
pub use async_trait::async_trait;
