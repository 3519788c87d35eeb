//! In-process token buckets, one per client key, behind a single mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::ratelimit::Limiter;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: f64,
}

impl Bucket {
    /// Apply natural refill. Regeneration only happens below capacity, so
    /// burst tokens from paid refills are preserved; the elapsed interval is
    /// consumed either way.
    fn refresh(&mut self, now: f64, capacity: f64, refill_rate: f64) {
        let elapsed = now - self.last_refill;
        if self.tokens < capacity {
            self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        }
        self.last_refill = now;
    }
}

/// In-memory token bucket limiter.
///
/// Buckets are created lazily at full capacity on first reference and live
/// for the process lifetime. Every operation runs under one mutex; the
/// critical section is O(1) arithmetic.
pub struct MemoryTokenBucket {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl MemoryTokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::with_clock(capacity, refill_rate, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: f64, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn bucket_mut<'a>(
        &self,
        buckets: &'a mut HashMap<String, Bucket>,
        key: &str,
        now: f64,
    ) -> &'a mut Bucket {
        buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        })
    }
}

#[async_trait]
impl Limiter for MemoryTokenBucket {
    async fn allow(&self, key: &str) -> Result<bool, Error> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_mut(&mut buckets, key, now);
        bucket.refresh(now, self.capacity, self.refill_rate);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn refill(&self, key: &str, tokens: f64) -> Result<(), Error> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_mut(&mut buckets, key, now);
        // No cap: tokens above capacity are burst tokens and decay only
        // through consumption.
        bucket.tokens += tokens;
        Ok(())
    }

    async fn available(&self, key: &str) -> Result<f64, Error> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_mut(&mut buckets, key, now);
        bucket.refresh(now, self.capacity, self.refill_rate);
        Ok(bucket.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9
    }

    async fn drain(limiter: &MemoryTokenBucket, key: &str, n: usize) {
        for i in 0..n {
            assert!(
                limiter.allow(key).await.unwrap(),
                "request {} should be allowed",
                i + 1
            );
        }
    }

    #[tokio::test]
    async fn allow_consumes_capacity_then_rejects() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(5.0, 1.0, clock);

        drain(&limiter, "client", 5).await;
        assert!(!limiter.allow("client").await.unwrap());
    }

    #[tokio::test]
    async fn natural_refill_restores_single_token() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(5.0, 10.0, Arc::clone(&clock) as Arc<dyn Clock>);

        drain(&limiter, "client", 5).await;
        assert!(!limiter.allow("client").await.unwrap());

        // 0.1 s at 10 tokens/sec refills exactly one token.
        clock.advance(0.1);
        assert!(limiter.allow("client").await.unwrap());
        assert!(!limiter.allow("client").await.unwrap());
    }

    #[tokio::test]
    async fn natural_refill_caps_at_capacity() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(5.0, 100.0, Arc::clone(&clock) as Arc<dyn Clock>);

        drain(&limiter, "client", 1).await;
        clock.advance(60.0);
        assert!(approx(limiter.available("client").await.unwrap(), 5.0));
    }

    #[tokio::test]
    async fn fresh_key_starts_full() {
        let clock = ManualClock::new(1000.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, clock);
        assert!(approx(limiter.available("never-seen").await.unwrap(), 4.0));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(2.0, 1.0, clock);

        drain(&limiter, "a", 2).await;
        assert!(!limiter.allow("a").await.unwrap());
        assert!(limiter.allow("b").await.unwrap());
    }

    #[tokio::test]
    async fn refill_grants_spendable_tokens() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(5.0, 1.0, clock);

        drain(&limiter, "client", 5).await;
        assert!(!limiter.allow("client").await.unwrap());

        limiter.refill("client", 3.0).await.unwrap();
        drain(&limiter, "client", 3).await;
        assert!(!limiter.allow("client").await.unwrap());
    }

    #[tokio::test]
    async fn refill_exceeds_capacity() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(5.0, 1.0, clock);

        // Full bucket plus 5 paid tokens: 10 spendable.
        limiter.refill("client", 5.0).await.unwrap();
        let mut allowed = 0;
        for _ in 0..12 {
            if limiter.allow("client").await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn burst_tokens_do_not_regenerate() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        // Scenario: refill on a full bucket, then idle.
        limiter.refill("client", 4.0).await.unwrap();
        assert!(approx(limiter.available("client").await.unwrap(), 8.0));

        clock.advance(1.0);
        assert!(approx(limiter.available("client").await.unwrap(), 8.0));

        drain(&limiter, "client", 2).await;
        assert!(approx(limiter.available("client").await.unwrap(), 6.0));

        clock.advance(1.0);
        assert!(approx(limiter.available("client").await.unwrap(), 6.0));
    }

    #[tokio::test]
    async fn natural_refill_resumes_below_capacity() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        limiter.refill("client", 4.0).await.unwrap();
        drain(&limiter, "client", 6).await;
        assert!(approx(limiter.available("client").await.unwrap(), 2.0));

        // Below capacity again: 0.5 s at 4/sec accrues 2 tokens, capped at 4.
        clock.advance(0.5);
        assert!(approx(limiter.available("client").await.unwrap(), 4.0));
        clock.advance(10.0);
        assert!(approx(limiter.available("client").await.unwrap(), 4.0));
    }

    #[tokio::test]
    async fn above_capacity_interval_is_consumed_not_banked() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        limiter.refill("client", 4.0).await.unwrap();

        // Two seconds pass above capacity; the interval must not be cashed
        // in once the bucket later drops below capacity.
        clock.advance(2.0);
        assert!(approx(limiter.available("client").await.unwrap(), 8.0));

        drain(&limiter, "client", 5).await;
        assert!(approx(limiter.available("client").await.unwrap(), 3.0));

        // Only time elapsed after crossing below capacity accrues.
        clock.advance(0.25);
        assert!(approx(limiter.available("client").await.unwrap(), 4.0));
    }

    #[tokio::test]
    async fn fractional_tokens_accumulate_silently() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        drain(&limiter, "client", 4).await;

        // 0.2 s at 4/sec: 0.8 tokens, not yet enough for a request.
        clock.advance(0.2);
        assert!(!limiter.allow("client").await.unwrap());
        let avail = limiter.available("client").await.unwrap();
        assert!(avail > 0.7 && avail < 0.9, "got {avail}");

        clock.advance(0.1);
        assert!(limiter.allow("client").await.unwrap());
    }

    #[tokio::test]
    async fn refill_adds_exactly_amount_on_top_of_accrual() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        drain(&limiter, "client", 4).await;
        clock.advance(0.2);

        let before = limiter.available("client").await.unwrap();
        limiter.refill("client", 4.0).await.unwrap();
        let after = limiter.available("client").await.unwrap();
        assert!(approx(after - before, 4.0), "before={before} after={after}");
    }

    #[tokio::test]
    async fn refill_then_consume_round_trips() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        drain(&limiter, "client", 2).await;
        let before = limiter.available("client").await.unwrap();

        limiter.refill("client", 3.0).await.unwrap();
        drain(&limiter, "client", 3).await;

        let after = limiter.available("client").await.unwrap();
        assert!(approx(before, after), "before={before} after={after}");
    }

    #[tokio::test]
    async fn multiple_refills_stack() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 1.0, clock);

        limiter.refill("client", 4.0).await.unwrap();
        limiter.refill("client", 4.0).await.unwrap();
        assert!(approx(limiter.available("client").await.unwrap(), 12.0));

        let mut allowed = 0;
        for _ in 0..15 {
            if limiter.allow("client").await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 12);
    }

    #[tokio::test]
    async fn sustained_rate_at_refill_rate_never_rejects() {
        let clock = ManualClock::new(0.0);
        let limiter = MemoryTokenBucket::with_clock(4.0, 4.0, Arc::clone(&clock) as Arc<dyn Clock>);

        // One request every 0.25 s matches the 4/sec refill rate exactly.
        for _ in 0..100 {
            assert!(limiter.allow("client").await.unwrap());
            clock.advance(0.25);
        }
    }

    #[tokio::test]
    async fn concurrent_allows_never_overspend() {
        let limiter = Arc::new(MemoryTokenBucket::new(1000.0, 0.000001));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut allowed = 0usize;
                for _ in 0..100 {
                    if limiter.allow("shared").await.unwrap() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1000);
    }
}
