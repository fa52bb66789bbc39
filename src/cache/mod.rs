//! Request-coalescing cache for remote sensor queries.
//!
//! One [`CacheCoordinator`] owns every cache entry of the process. Each entry is
//! keyed by a caller-derived string and moves through `empty -> in flight -> ready`
//! exactly once. Callers that arrive while a key is in flight are parked on the
//! entry's waitlist and resolved in arrival order when the single fetch completes.
//! Later completions of the same fetch are push updates and go to the one
//! registered observer of the key.

mod coordinator;
mod request;

pub use coordinator::{
    CacheCoordinator, Completion, Delivery, Dispatch, EntryStatus, FailurePolicy,
};
pub use request::{CacheRequest, Observe, ObserverFn};
