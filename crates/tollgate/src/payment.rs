//! x402 wire types and payment-header decoding.
//!
//! A payment travels in the `PAYMENT-SIGNATURE` header (legacy `X-PAYMENT`)
//! as base64-encoded JSON. Its `payload.authorization` carries the signed
//! transfer authorization; the facilitator owns signature checking, so these
//! types only need to round-trip the wire format and surface the payer id.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Protocol version stamped on 402 bodies and payment payloads.
pub const X402_VERSION: u32 = 1;

/// Token decimal places used when converting a dollar price to units.
pub const PRICE_DECIMALS: u32 = 6;

/// Signed transfer authorization for the `exact` scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

/// Scheme-specific payment data: the authorization plus its signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactPaymentData {
    pub signature: String,
    pub authorization: PaymentAuthorization,
}

/// Wire-format payment payload (base64-encoded JSON in the payment header).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPaymentData,
}

/// A single entry in the `accepts` array of a 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub price: String,
    pub amount: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The 402 response body returned when a request needs payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u32,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Decode a payment header into a [`PaymentPayload`].
///
/// Accepts standard base64 first, then URL-safe, since clients differ.
pub fn decode_payment_header(header_value: &str) -> Result<PaymentPayload, Error> {
    let bytes = decode_base64(header_value)
        .ok_or_else(|| Error::InvalidPayment("invalid base64 in payment header".to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidPayment(format!("invalid JSON payload: {e}")))
}

/// Extract the payer wallet address from a payment header, lowercased.
///
/// Best-effort: any decode or parse failure yields an empty string, which
/// the trust tracker never trusts.
pub fn payer_from_header(header_value: &str) -> String {
    let Some(bytes) = decode_base64(header_value) else {
        return String::new();
    };

    #[derive(Default, Deserialize)]
    struct LoosePayload {
        #[serde(default)]
        payload: LooseData,
    }
    #[derive(Default, Deserialize)]
    struct LooseData {
        #[serde(default)]
        authorization: LooseAuthorization,
    }
    #[derive(Default, Deserialize)]
    struct LooseAuthorization {
        #[serde(default)]
        from: String,
    }

    match serde_json::from_slice::<LoosePayload>(&bytes) {
        Ok(p) => p.payload.authorization.from.to_lowercase(),
        Err(_) => String::new(),
    }
}

fn decode_base64(value: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(value))
        .ok()
}

/// Parse a human-readable price string (e.g. `"$0.001"`) into token units.
///
/// Uses [`PRICE_DECIMALS`] decimal places, so `"$0.001"` becomes `"1000"`.
pub fn parse_price(price: &str) -> Result<String, Error> {
    let raw = price
        .strip_prefix('$')
        .ok_or_else(|| Error::InvalidPrice(format!("price must start with '$': {price}")))?;

    let (whole, frac) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(Error::InvalidPrice(format!("no digits in price: {price}")));
    }
    if frac.len() > PRICE_DECIMALS as usize {
        return Err(Error::InvalidPrice(format!(
            "more than {PRICE_DECIMALS} decimal places: {price}"
        )));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidPrice(format!("non-numeric price: {price}")));
    }

    let whole_units: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| Error::InvalidPrice(format!("price too large: {price}")))?
    };
    let mut frac_padded = frac.to_string();
    while frac_padded.len() < PRICE_DECIMALS as usize {
        frac_padded.push('0');
    }
    let frac_units: u128 = frac_padded
        .parse()
        .map_err(|_| Error::InvalidPrice(format!("invalid fraction: {price}")))?;

    Ok((whole_units * 10u128.pow(PRICE_DECIMALS) + frac_units).to_string())
}
