//! Client for the external payment facilitator.
//!
//! The facilitator owns signature verification and on-chain settlement; this
//! module only speaks its HTTP API. Verification is cheap (tens of
//! milliseconds), settlement is slow (seconds) and may fail.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::payment::{PaymentPayload, PaymentRequiredBody, PaymentRequirements, X402_VERSION};

/// Default per-call HTTP timeout for verify/settle.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the best-effort startup probe.
pub const SUPPORTED_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from the facilitator's `/verify` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Response from the facilitator's `/settle` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Transaction hash, if settlement succeeded. `None` on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: String,
}

/// Facilitator contract: verify a signed payment, settle it on-chain.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Error>;

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Error>;
}

/// HTTP client for a remote facilitator.
pub struct HttpFacilitator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFacilitator {
    /// Build a client with the default 10 s per-call timeout.
    pub fn new(base_url: &str) -> Result<Self, Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Best-effort startup probe of the facilitator's `/supported` endpoint.
    ///
    /// Callers log the failure and keep serving; an unreachable facilitator
    /// only disables paid refills, not the limiter.
    pub async fn probe_supported(&self) -> Result<serde_json::Value, Error> {
        let url = format!("{}/supported", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(SUPPORTED_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Facilitator(format!("supported probe failed: {e}")))?;
        resp.json()
            .await
            .map_err(|e| Error::Facilitator(format!("supported probe parse failed: {e}")))
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<T, Error> {
        let url = format!("{}/{endpoint}", self.base_url);
        let body = serde_json::json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Facilitator(format!("{endpoint} request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Facilitator(format!(
                "{endpoint} returned {status}: {text}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Facilitator(format!("{endpoint} response parse failed: {e}")))
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Error> {
        self.post("verify", payload, requirements).await
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Error> {
        self.post("settle", payload, requirements).await
    }
}

/// Build the 402 Payment Required response body.
pub fn payment_required_body(requirements: &PaymentRequirements) -> PaymentRequiredBody {
    PaymentRequiredBody {
        x402_version: X402_VERSION,
        accepts: vec![requirements.clone()],
        description: requirements.description.clone(),
        mime_type: requirements.mime_type.clone(),
    }
}
