//! Call plumbing shared by every adapter: pacing, retries and construction.

mod adapter_registry;
mod backoff;
mod rate_limiter;

pub use adapter_registry::{AdapterFactory, DefaultAdapterFactory};
pub use backoff::{call_with_backoff, call_with_retry, BackoffPolicy};
pub use rate_limiter::{limiter_key, RateLimiter};
