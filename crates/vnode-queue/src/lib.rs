//! Reconcile queue and monitor variable shared by the vnode controllers
//!
//! - [`Queue`]: rate-limited FIFO keyed by string, with per-key deduplication,
//!   delayed insertion and a retry budget
//! - [`Monitor`]: latched, versioned value with one-shot change signals

#![deny(missing_docs)]

pub mod monitor;
pub mod queue;
pub mod rate_limiter;

pub use monitor::{Monitor, Subscription, Versioned};
pub use queue::{default_retry, Queue, QueueBuilder, RetryDecision, RetryFn, MAX_RETRIES};
pub use rate_limiter::{
    default_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
