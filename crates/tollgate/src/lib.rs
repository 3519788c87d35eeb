//! Payment-refillable admission control.
//!
//! Meters requests per client through a token-bucket rate limiter and, on
//! exhaustion, accepts a signed off-chain payment to refill that client's
//! quota. Signature verification and on-chain settlement are delegated to an
//! external facilitator service.
//!
//! # Components
//!
//! - [`ratelimit`] — the [`Limiter`](ratelimit::Limiter) contract with
//!   in-process ([`MemoryTokenBucket`](ratelimit::MemoryTokenBucket)) and
//!   Redis-backed ([`RedisTokenBucket`](ratelimit::RedisTokenBucket))
//!   implementations
//! - [`trust`] — sliding-window per-payer reputation for the optimistic
//!   settlement fast path
//! - [`settlement`] — single-consumer background settlement queue
//! - [`facilitator`] — HTTP client for the facilitator's verify/settle API
//! - [`payment`] — x402 wire types and payment-header decoding
//!
//! # Burst tokens
//!
//! Paid refills are not capped at bucket capacity. Natural regeneration is
//! suppressed while a bucket sits above its capacity, so purchased tokens
//! persist until spent and decay only through consumption.

pub mod clock;
pub mod error;
pub mod facilitator;
pub mod payment;
pub mod ratelimit;
pub mod settlement;
pub mod trust;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Error;
pub use facilitator::{
    payment_required_body, Facilitator, HttpFacilitator, SettleResponse, VerifyResponse,
};
pub use payment::{
    decode_payment_header, parse_price, payer_from_header, PaymentAuthorization, PaymentPayload,
    PaymentRequiredBody, PaymentRequirements, X402_VERSION,
};
pub use ratelimit::{Limiter, MemoryTokenBucket, RedisTokenBucket};
pub use settlement::{SettlementJob, SettlementQueue};
pub use trust::{TrustConfig, TrustStats, TrustTracker};
