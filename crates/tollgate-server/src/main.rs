use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::facilitator::{Facilitator, HttpFacilitator, SUPPORTED_PROBE_TIMEOUT};
use tollgate::payment::{parse_price, PaymentRequirements};
use tollgate::ratelimit::{Limiter, MemoryTokenBucket, RedisConfig, RedisTokenBucket};
use tollgate::settlement::SettlementQueue;
use tollgate::trust::{TrustConfig, TrustTracker};

use tollgate_server::config::{Config, Strategy};
use tollgate_server::state::AppState;
use tollgate_server::handlers;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(path = %config_path, error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    let port = match config.port() {
        Ok(port) => port,
        Err(e) => {
            tracing::error!(error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let limiter: Arc<dyn Limiter> = match config.ratelimit.strategy {
        Strategy::Redis => {
            let redis_cfg = RedisConfig {
                url: config.redis.url(),
                capacity: config.ratelimit.capacity,
                refill_rate: config.ratelimit.refill_rate,
                key_prefix: None,
            };
            match RedisTokenBucket::connect(redis_cfg).await {
                Ok(bucket) => {
                    tracing::info!(addr = %config.redis.addr, "using Redis rate limiter");
                    Arc::new(bucket)
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to connect to Redis");
                    std::process::exit(1);
                }
            }
        }
        Strategy::Memory => {
            tracing::info!("using in-memory rate limiter");
            Arc::new(MemoryTokenBucket::new(
                config.ratelimit.capacity,
                config.ratelimit.refill_rate,
            ))
        }
    };

    let state = if config.payment.enabled {
        let http_facilitator = match HttpFacilitator::new(&config.payment.facilitator_url) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "failed to build facilitator client");
                std::process::exit(1);
            }
        };

        // Best-effort sync with the facilitator; an outage here only delays
        // paid refills, so keep serving either way.
        match tokio::time::timeout(SUPPORTED_PROBE_TIMEOUT, http_facilitator.probe_supported())
            .await
        {
            Ok(Ok(_)) => tracing::info!("facilitator reachable"),
            Ok(Err(e)) => tracing::warn!(error = %e, "facilitator probe failed"),
            Err(_) => tracing::warn!("facilitator probe timed out"),
        }
        let facilitator: Arc<dyn Facilitator> = Arc::new(http_facilitator);

        // parse_price was validated at config load.
        let amount = parse_price(&config.payment.price_per_capacity).unwrap_or_default();
        let requirements = PaymentRequirements {
            scheme: "exact".to_string(),
            network: config.payment.network.clone(),
            price: config.payment.price_per_capacity.clone(),
            amount,
            pay_to: config.payment.wallet_address.clone(),
            max_timeout_seconds: 30,
            description: Some(
                "CPU utilization endpoint - pay to refill rate limit".to_string(),
            ),
            mime_type: Some("application/json".to_string()),
        };

        let (trust, settlement_queue) = if config.payment.optimistic.enabled {
            let tracker = Arc::new(TrustTracker::new(TrustConfig {
                threshold: config.payment.optimistic.trust_threshold,
                window: config.payment.optimistic.trust_window,
            }));
            let queue = Arc::new(SettlementQueue::new(
                Arc::clone(&facilitator),
                Arc::clone(&tracker),
            ));
            tracing::info!(
                threshold = config.payment.optimistic.trust_threshold,
                window = %humantime::format_duration(config.payment.optimistic.trust_window),
                "optimistic settlement enabled"
            );
            (Some(tracker), Some(queue))
        } else {
            (None, None)
        };

        tracing::info!(
            price = %config.payment.price_per_capacity,
            currency = %config.payment.currency,
            network = %config.payment.network,
            "payment enabled"
        );

        AppState {
            config: Arc::new(config),
            limiter,
            facilitator: Some(facilitator),
            requirements: Some(requirements),
            trust,
            settlement_queue,
        }
    } else {
        AppState::rate_limit_only(config, limiter)
    };

    tracing::info!(
        port,
        capacity = state.config.ratelimit.capacity,
        refill_rate = state.config.ratelimit.refill_rate,
        "server starting"
    );

    let queue_for_shutdown = state.settlement_queue.clone();
    let app_state = web::Data::new(state);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .service(handlers::cpu)
            .service(handlers::tokens)
            .service(handlers::dashboard)
            .service(handlers::metrics_endpoint)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    // Drain in-flight settlements before exit.
    if let Some(queue) = queue_for_shutdown {
        tracing::info!(pending = queue.pending(), "draining settlement queue");
        queue.close().await;
    }

    result
}
