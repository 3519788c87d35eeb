//! Per-request admission pipeline.
//!
//! Order of business for a protected request: consult the limiter; on a
//! miss, turn a payment header into quota. Trusted payers are served
//! immediately and settled in the background; everyone else waits for
//! on-chain settlement before the refill lands.

use actix_web::{HttpRequest, HttpResponse};

use tollgate::facilitator::payment_required_body;
use tollgate::payment::payer_from_header;
use tollgate::settlement::{truncate_wallet, SettlementJob};
use tollgate::PaymentRequirements;

use crate::metrics::{ADMISSIONS, PAYMENT_ATTEMPTS};
use crate::state::AppState;

/// How a request cleared admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A bucket token was available.
    Allowed,
    /// Trusted payer: refilled immediately, settlement queued.
    Optimistic,
    /// Untrusted payer: settled on-chain before the refill.
    Synchronous,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Allowed => "allowed",
            Admission::Optimistic => "optimistic",
            Admission::Synchronous => "synchronous",
        }
    }
}

/// Rate-limit key for a request: the client's source IP.
pub fn client_key(req: &HttpRequest) -> String {
    let info = req.connection_info();
    match info.realip_remote_addr() {
        // Peer addresses come as "ip:port"; forwarded headers as bare IPs.
        Some(addr) => match addr.parse::<std::net::SocketAddr>() {
            Ok(sock) => sock.ip().to_string(),
            Err(_) => addr.to_string(),
        },
        None => "unknown".to_string(),
    }
}

/// The payment header if present: `PAYMENT-SIGNATURE`, then legacy `X-PAYMENT`.
fn payment_header(req: &HttpRequest) -> Option<String> {
    for name in ["PAYMENT-SIGNATURE", "X-PAYMENT"] {
        if let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Run the admission pipeline for a protected request.
///
/// `Ok` means the request proceeds to the handler; `Err` carries the
/// response to return instead.
pub async fn admit(req: &HttpRequest, state: &AppState) -> Result<Admission, HttpResponse> {
    let key = client_key(req);

    let allowed = match state.limiter.allow(&key).await {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::error!(error = %e, client = %key, "rate limiter error");
            return Err(HttpResponse::InternalServerError()
                .json(serde_json::json!({"error": "Rate limiter error"})));
        }
    };

    if allowed {
        ADMISSIONS.with_label_values(&["allowed"]).inc();
        return Ok(Admission::Allowed);
    }

    // Rate limited. Without payment support this is a plain 429.
    let (Some(facilitator), Some(requirements)) = (&state.facilitator, &state.requirements) else {
        ADMISSIONS.with_label_values(&["throttled"]).inc();
        return Err(HttpResponse::TooManyRequests()
            .insert_header(("Retry-After", "1"))
            .json(serde_json::json!({"error": "Too Many Requests"})));
    };

    let Some(header) = payment_header(req) else {
        ADMISSIONS.with_label_values(&["needs_payment"]).inc();
        let body = payment_required_body(requirements);
        return Err(HttpResponse::PaymentRequired().json(body));
    };

    let verify_start = std::time::Instant::now();
    let payload = match tollgate::decode_payment_header(&header) {
        Ok(p) => p,
        Err(e) => {
            PAYMENT_ATTEMPTS.with_label_values(&["rejected"]).inc();
            tracing::warn!(error = %e, client = %key, "undecodable payment header");
            return Err(rejected_response(requirements, &e.to_string()));
        }
    };

    match facilitator.verify(&payload, requirements).await {
        Ok(v) if v.is_valid => {}
        Ok(v) => {
            PAYMENT_ATTEMPTS.with_label_values(&["rejected"]).inc();
            let reason = v.invalid_reason.unwrap_or_else(|| "invalid payment".to_string());
            tracing::warn!(reason = %reason, client = %key, "payment verification rejected");
            return Err(rejected_response(requirements, &reason));
        }
        Err(e) => {
            PAYMENT_ATTEMPTS.with_label_values(&["error"]).inc();
            tracing::warn!(error = %e, client = %key, "payment verification unavailable");
            return Err(rejected_response(requirements, "payment verification failed"));
        }
    }
    let verify_latency = verify_start.elapsed();

    let payer = payer_from_header(&header);

    // Trusted payer: refill now, settle in the background.
    if let (Some(trust), Some(queue)) = (&state.trust, &state.settlement_queue) {
        if trust.is_trusted(&payer) {
            let capacity = state.config.ratelimit.capacity;
            if let Err(e) = state.limiter.refill(&key, capacity).await {
                tracing::error!(error = %e, client = %key, "refill error");
                return Err(HttpResponse::InternalServerError()
                    .json(serde_json::json!({"error": "Refill error"})));
            }
            debit_current_request(state, &key).await;

            tracing::info!(
                payer = %truncate_wallet(&payer),
                verify_ms = verify_latency.as_millis() as u64,
                "trusted payer, queueing settlement"
            );
            if let Err(e) = queue
                .enqueue(SettlementJob::new(
                    payload,
                    requirements.clone(),
                    payer.clone(),
                ))
                .await
            {
                // Shutdown race: the refill already landed, so serve the
                // request and let the operator reconcile from the log.
                tracing::error!(error = %e, payer = %truncate_wallet(&payer),
                    "failed to enqueue settlement after refill");
            }
            ADMISSIONS.with_label_values(&["optimistic"]).inc();
            return Ok(Admission::Optimistic);
        }
    }

    // Untrusted payer: settle before responding.
    let settle_start = std::time::Instant::now();
    let settle = match facilitator.settle(&payload, requirements).await {
        Ok(s) => s,
        Err(e) => {
            PAYMENT_ATTEMPTS.with_label_values(&["error"]).inc();
            tracing::warn!(error = %e, client = %key, "settlement unreachable");
            return Err(HttpResponse::PaymentRequired().json(serde_json::json!({
                "error": "Settlement failed",
                "reason": e.to_string(),
            })));
        }
    };
    let settle_latency = settle_start.elapsed();

    if !settle.success {
        PAYMENT_ATTEMPTS.with_label_values(&["settle_failed"]).inc();
        ADMISSIONS.with_label_values(&["settle_failed"]).inc();
        tracing::warn!(
            reason = settle.error_reason.as_deref().unwrap_or("unknown"),
            client = %key,
            "synchronous settlement failed"
        );
        return Err(HttpResponse::PaymentRequired().json(serde_json::json!({
            "error": "Settlement failed",
            "reason": settle.error_reason,
        })));
    }

    let transaction = settle.transaction.unwrap_or_default();
    let capacity = state.config.ratelimit.capacity;
    if let Err(e) = state.limiter.refill(&key, capacity).await {
        // The worst outcome: money settled on-chain but no quota granted.
        // Surface the txid so an operator can reconcile.
        tracing::error!(
            error = %e,
            transaction = %transaction,
            client = %key,
            "refill failed after settlement"
        );
        return Err(HttpResponse::InternalServerError()
            .json(serde_json::json!({"error": "Refill error"})));
    }
    debit_current_request(state, &key).await;

    if let Some(trust) = &state.trust {
        trust.record_success(&payer);
        tracing::info!(
            transaction = %transaction,
            payer = %truncate_wallet(&payer),
            verify_ms = verify_latency.as_millis() as u64,
            settle_ms = settle_latency.as_millis() as u64,
            trust = trust.recent_payments(&payer),
            "payment settled"
        );
    } else {
        tracing::info!(
            transaction = %transaction,
            verify_ms = verify_latency.as_millis() as u64,
            settle_ms = settle_latency.as_millis() as u64,
            "payment settled"
        );
    }

    PAYMENT_ATTEMPTS.with_label_values(&["success"]).inc();
    ADMISSIONS.with_label_values(&["synchronous"]).inc();
    Ok(Admission::Synchronous)
}

/// Consume one token for the request the payment just admitted. The refill
/// granted a full capacity regardless of bucket level; this request still
/// spends a token like any other.
async fn debit_current_request(state: &AppState, key: &str) {
    if let Err(e) = state.limiter.allow(key).await {
        tracing::warn!(error = %e, client = %key, "post-refill debit failed");
    }
}

/// 402 with the verifier-supplied reason folded into the requirements body.
fn rejected_response(requirements: &PaymentRequirements, reason: &str) -> HttpResponse {
    let mut body = payment_required_body(requirements);
    body.description = Some(reason.to_string());
    HttpResponse::PaymentRequired().json(body)
}
