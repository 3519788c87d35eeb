//! Sliding-window payer reputation.
//!
//! A payer becomes trusted after `threshold` successful settlements inside
//! `window`, unlocking the optimistic path (serve first, settle in the
//! background). One failed optimistic settlement deletes the payer's whole
//! record: trust is forfeited, but no tokens are clawed back and no fee is
//! charged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::clock::{Clock, SystemClock};

const DEFAULT_THRESHOLD: usize = 3;
const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Trust tracker configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrustConfig {
    /// Successful payments needed to become trusted.
    pub threshold: usize,
    /// Time window for counting payments.
    pub window: Duration,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Trust statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrustStats {
    pub trusted_wallets: usize,
    pub total_wallets_seen: usize,
}

/// Tracks per-payer settlement history under a reader-writer lock.
///
/// Reads (`is_trusted`, `recent_payments`, `stats`) proceed in parallel;
/// writes are exclusive. Pruning happens inside `record_success`, so no
/// background sweeper is needed.
pub struct TrustTracker {
    payments: RwLock<HashMap<String, Vec<f64>>>,
    threshold: usize,
    window_secs: f64,
    clock: Arc<dyn Clock>,
}

impl TrustTracker {
    pub fn new(cfg: TrustConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: TrustConfig, clock: Arc<dyn Clock>) -> Self {
        let threshold = if cfg.threshold == 0 {
            DEFAULT_THRESHOLD
        } else {
            cfg.threshold
        };
        let window = if cfg.window.is_zero() {
            DEFAULT_WINDOW
        } else {
            cfg.window
        };
        Self {
            payments: RwLock::new(HashMap::new()),
            threshold,
            window_secs: window.as_secs_f64(),
            clock,
        }
    }

    /// True iff the payer has at least `threshold` successes inside the window.
    ///
    /// The empty payer id (unparseable payment header) is never trusted.
    pub fn is_trusted(&self, payer: &str) -> bool {
        if payer.is_empty() {
            return false;
        }
        let payments = self.payments.read().unwrap();
        self.count_recent(&payments, payer) >= self.threshold
    }

    /// Record a successful settlement, pruning entries older than the window.
    pub fn record_success(&self, payer: &str) {
        let now = self.clock.now();
        let cutoff = now - self.window_secs;
        let mut payments = self.payments.write().unwrap();
        let entry = payments.entry(payer.to_string()).or_default();
        entry.push(now);
        entry.retain(|&ts| ts > cutoff);
    }

    /// Soft penalty: drop the payer's whole record so they must rebuild
    /// trust through synchronous settlements.
    pub fn record_failure(&self, payer: &str) {
        let mut payments = self.payments.write().unwrap();
        payments.remove(payer);
    }

    /// Count of in-window successes for a payer.
    pub fn recent_payments(&self, payer: &str) -> usize {
        let payments = self.payments.read().unwrap();
        self.count_recent(&payments, payer)
    }

    pub fn stats(&self) -> TrustStats {
        let payments = self.payments.read().unwrap();
        let trusted = payments
            .keys()
            .filter(|payer| self.count_recent(&payments, payer) >= self.threshold)
            .count();
        TrustStats {
            trusted_wallets: trusted,
            total_wallets_seen: payments.len(),
        }
    }

    fn count_recent(&self, payments: &HashMap<String, Vec<f64>>, payer: &str) -> usize {
        let cutoff = self.clock.now() - self.window_secs;
        payments
            .get(payer)
            .map(|stamps| stamps.iter().filter(|&&ts| ts > cutoff).count())
            .unwrap_or(0)
    }
}
