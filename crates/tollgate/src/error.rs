use thiserror::Error;

/// Errors returned by admission-control operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rate limit store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("rate limit store returned malformed state: {0}")]
    MalformedState(String),

    #[error("facilitator error: {0}")]
    Facilitator(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("settlement queue closed")]
    QueueClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
