use std::sync::Arc;

use tollgate::facilitator::Facilitator;
use tollgate::payment::PaymentRequirements;
use tollgate::ratelimit::Limiter;
use tollgate::settlement::SettlementQueue;
use tollgate::trust::TrustTracker;

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<dyn Limiter>,
    /// Present when payment is enabled.
    pub facilitator: Option<Arc<dyn Facilitator>>,
    /// Requirements advertised in 402 responses; present when payment is enabled.
    pub requirements: Option<PaymentRequirements>,
    /// Present when optimistic settlement is enabled.
    pub trust: Option<Arc<TrustTracker>>,
    pub settlement_queue: Option<Arc<SettlementQueue>>,
}

impl AppState {
    /// Rate-limited state without payment: exhaustion is a plain 429.
    pub fn rate_limit_only(config: Config, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            config: Arc::new(config),
            limiter,
            facilitator: None,
            requirements: None,
            trust: None,
            settlement_queue: None,
        }
    }
}
