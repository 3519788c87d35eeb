//! Redis-backed shared token buckets.
//!
//! Each bucket is a hash at `<prefix><client_key>` with fields `tokens` and
//! `last_refill`. Every operation is a single Lua script, so the
//! refill-then-consume sequence is atomic under Redis's single-threaded
//! script execution. The caller supplies `now` (microsecond-precision
//! seconds from the injected clock); skew across callers is bounded by
//! clock drift and tolerated.
//!
//! Scripts end by resetting a per-key idle expiry of
//! `⌈capacity / refill_rate⌉ + 1` seconds, the time an untouched bucket
//! needs to regenerate fully anyway.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::ratelimit::Limiter;

const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Atomic natural refill + single-token consume.
const ALLOW_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local data = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(data[1]) or capacity
local last_refill = tonumber(data[2]) or now

-- Natural refill only below capacity: preserves overflow from paid refills
local elapsed = now - last_refill
if tokens < capacity then
    tokens = tokens + elapsed * refill_rate
    if tokens > capacity then
        tokens = capacity
    end
end

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call("HSET", key, "tokens", tokens, "last_refill", now)
redis.call("EXPIRE", key, math.ceil(capacity / refill_rate) + 1)
return allowed
"#;

/// Uncapped addition of paid tokens. Does not touch last_refill; the other
/// scripts default a missing last_refill to their own "now", so a
/// first-touch refill observes zero elapsed time on the next operation.
const REFILL_SCRIPT: &str = r#"
local key = KEYS[1]
local tokens_to_add = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])

local current = tonumber(redis.call("HGET", key, "tokens")) or capacity
local new_tokens = current + tokens_to_add
-- No cap: overflow beyond capacity is paid burst

redis.call("HSET", key, "tokens", new_tokens)
redis.call("EXPIRE", key, math.ceil(capacity / refill_rate) + 1)
return {tostring(current), tostring(new_tokens)}
"#;

/// Read-only snapshot after natural refill. Returned as a string because a
/// Lua number reply would be truncated to an integer.
const AVAILABLE_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local data = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if tokens == nil then
    return tostring(capacity)
end

if last_refill ~= nil and tokens < capacity then
    local elapsed = now - last_refill
    tokens = tokens + elapsed * refill_rate
    if tokens > capacity then
        tokens = capacity
    end
end

redis.call("EXPIRE", key, math.ceil(capacity / refill_rate) + 1)
return tostring(tokens)
"#;

/// Configuration for the Redis token bucket.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379/0`.
    pub url: String,
    pub capacity: f64,
    pub refill_rate: f64,
    /// Key prefix, defaults to `ratelimit:`.
    pub key_prefix: Option<String>,
}

/// Distributed token bucket backed by Redis.
///
/// The authoritative implementation for multi-process deployments; its
/// observable behavior matches [`MemoryTokenBucket`](super::MemoryTokenBucket).
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    capacity: f64,
    refill_rate: f64,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    allow_script: Script,
    refill_script: Script,
    available_script: Script,
}

impl RedisTokenBucket {
    pub async fn connect(cfg: RedisConfig) -> Result<Self, Error> {
        Self::connect_with_clock(cfg, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        cfg: RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            capacity: cfg.capacity,
            refill_rate: cfg.refill_rate,
            key_prefix: cfg
                .key_prefix
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            clock,
            allow_script: Script::new(ALLOW_SCRIPT),
            refill_script: Script::new(REFILL_SCRIPT),
            available_script: Script::new(AVAILABLE_SCRIPT),
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Limiter for RedisTokenBucket {
    async fn allow(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .allow_script
            .key(self.full_key(key))
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(self.clock.now())
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }

    async fn refill(&self, key: &str, tokens: f64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let counts: Vec<String> = self
            .refill_script
            .key(self.full_key(key))
            .arg(tokens)
            .arg(self.capacity)
            .arg(self.refill_rate)
            .invoke_async(&mut conn)
            .await?;

        // "before" reads as capacity when the key was never seen.
        let before = counts.first().map(String::as_str).unwrap_or("?");
        let after = counts.get(1).map(String::as_str).unwrap_or("?");
        tracing::info!(key, before, added = tokens, after, "bucket refilled");
        Ok(())
    }

    async fn available(&self, key: &str) -> Result<f64, Error> {
        let mut conn = self.conn.clone();
        let tokens: String = self
            .available_script
            .key(self.full_key(key))
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(self.clock.now())
            .invoke_async(&mut conn)
            .await?;
        tokens
            .parse()
            .map_err(|_| Error::MalformedState(format!("token count {tokens:?}")))
    }
}
