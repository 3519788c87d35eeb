//! Token-bucket rate limiting with burst-preserving regeneration.
//!
//! Two interchangeable back-ends implement [`Limiter`]: an in-process map
//! ([`MemoryTokenBucket`]) and a Redis-backed shared store
//! ([`RedisTokenBucket`]). Both apply the same natural-refill rule:
//!
//! ```text
//! Δ = now − last_refill
//! if tokens < capacity { tokens = min(capacity, tokens + Δ · refill_rate) }
//! last_refill = now
//! ```
//!
//! Regeneration is suppressed above capacity so that tokens added by
//! [`Limiter::refill`] (paid "burst" tokens) persist until consumed.

use async_trait::async_trait;

use crate::error::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryTokenBucket;
pub use redis::{RedisConfig, RedisTokenBucket};

/// The rate limiter contract, keyed by opaque client string.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Apply natural refill, then consume one token if at least one is
    /// available. Returns whether the request is permitted.
    async fn allow(&self, key: &str) -> Result<bool, Error>;

    /// Add `tokens` to the bucket without capping at capacity.
    ///
    /// This is the sole path by which a bucket may rise above capacity.
    async fn refill(&self, key: &str, tokens: f64) -> Result<(), Error>;

    /// Read the current token count after natural refill, without consuming.
    async fn available(&self, key: &str) -> Result<f64, Error>;
}
