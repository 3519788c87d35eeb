//! Background settlement queue.
//!
//! Exactly one consumer task executes settlements in FIFO order. The
//! single-consumer property is load-bearing: settlement draws nonces from
//! the operator's wallet, and interleaved settlements would collide. A
//! fixed delay between successive settlements lets prior on-chain state
//! propagate before the next transaction is built.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::facilitator::Facilitator;
use crate::payment::{PaymentPayload, PaymentRequirements};
use crate::trust::TrustTracker;

/// Default queue capacity; a full queue back-pressures enqueuers.
pub const DEFAULT_BUFFER: usize = 100;

/// Default pause between successive settlements.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// A settlement waiting for the background worker. Immutable after enqueue.
pub struct SettlementJob {
    pub payload: PaymentPayload,
    pub requirements: PaymentRequirements,
    pub payer: String,
    pub queued_at: Instant,
}

impl SettlementJob {
    pub fn new(payload: PaymentPayload, requirements: PaymentRequirements, payer: String) -> Self {
        Self {
            payload,
            requirements,
            payer,
            queued_at: Instant::now(),
        }
    }
}

/// Bounded FIFO of settlements with a single consumer task.
///
/// Settlement outcomes feed the trust tracker: success builds trust,
/// failure revokes it. A failed optimistic settlement is silent toward the
/// client (the request it paid for was already served) and costs the payer
/// nothing beyond their fast path.
pub struct SettlementQueue {
    tx: Mutex<Option<mpsc::Sender<SettlementJob>>>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SettlementQueue {
    pub fn new(facilitator: Arc<dyn Facilitator>, tracker: Arc<TrustTracker>) -> Self {
        Self::with_options(facilitator, tracker, DEFAULT_BUFFER, DEFAULT_SETTLE_DELAY)
    }

    pub fn with_options(
        facilitator: Arc<dyn Facilitator>,
        tracker: Arc<TrustTracker>,
        buffer: usize,
        settle_delay: Duration,
    ) -> Self {
        let buffer = if buffer == 0 { DEFAULT_BUFFER } else { buffer };
        let (tx, mut rx) = mpsc::channel::<SettlementJob>(buffer);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            let mut first = true;
            while let Some(job) = rx.recv().await {
                if !first {
                    tracing::debug!(
                        delay_ms = settle_delay.as_millis() as u64,
                        "waiting before next settlement"
                    );
                    tokio::time::sleep(settle_delay).await;
                }
                first = false;

                process_settlement(facilitator.as_ref(), tracker.as_ref(), job).await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Add a settlement job. Awaits when the queue is full, back-pressuring
    /// the admission pipeline.
    pub async fn enqueue(&self, job: SettlementJob) -> Result<(), Error> {
        let tx = {
            let guard = self.tx.lock().unwrap();
            guard.clone().ok_or(Error::QueueClosed)?
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::QueueClosed);
        }
        tracing::debug!(pending = self.pending(), "settlement enqueued");
        Ok(())
    }

    /// Number of settlements not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Drain the channel and wait for the consumer to exit.
    pub async fn close(&self) {
        self.tx.lock().unwrap().take();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "settlement worker exited abnormally");
            }
        }
    }
}

async fn process_settlement(facilitator: &dyn Facilitator, tracker: &TrustTracker, job: SettlementJob) {
    let queue_latency = job.queued_at.elapsed();
    let settle_start = Instant::now();

    let result = facilitator.settle(&job.payload, &job.requirements).await;
    let settle_latency = settle_start.elapsed();

    match result {
        Ok(ref settle) if settle.success => {
            tracker.record_success(&job.payer);
            tracing::info!(
                transaction = settle.transaction.as_deref().unwrap_or(""),
                payer = %truncate_wallet(&job.payer),
                queue_ms = queue_latency.as_millis() as u64,
                settle_ms = settle_latency.as_millis() as u64,
                "background settlement succeeded"
            );
        }
        Ok(settle) => {
            // Soft penalty: revoke trust, never debit tokens.
            tracker.record_failure(&job.payer);
            tracing::warn!(
                reason = settle.error_reason.as_deref().unwrap_or("unknown"),
                payer = %truncate_wallet(&job.payer),
                queue_ms = queue_latency.as_millis() as u64,
                "background settlement failed, trust revoked"
            );
        }
        Err(e) => {
            tracker.record_failure(&job.payer);
            tracing::warn!(
                error = %e,
                payer = %truncate_wallet(&job.payer),
                queue_ms = queue_latency.as_millis() as u64,
                "background settlement errored, trust revoked"
            );
        }
    }
}

/// Shorten a wallet address for logging.
pub fn truncate_wallet(wallet: &str) -> String {
    if wallet.len() <= 10 {
        wallet.to_string()
    } else {
        format!("{}...{}", &wallet[..6], &wallet[wallet.len() - 4..])
    }
}
