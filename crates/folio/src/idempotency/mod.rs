//! Exactly-once execution of keyed commands.
//!
//! A key moves through `absent -> Started -> Finished`. Expired records read
//! as absent and may be claimed again. The store's unique key is what makes
//! a claim atomic; the per-key lock only keeps concurrent first requests from
//! racing each other into contention errors.

mod coordinator;
mod middleware;
mod record;
mod store;

pub use coordinator::IdempotencyCoordinator;
pub use middleware::IdempotencyMiddleware;
pub use record::{IdempotencyClaim, IdempotencyRecord, IdempotencyStatus};
pub use store::{IdempotencyStore, MemoryIdempotencyStore};
