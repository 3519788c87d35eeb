//! HTTP handlers.
//!
//! `/cpu` is the admission-gated business endpoint; `/tokens`, `/dashboard`
//! and `/metrics` bypass admission.

use std::time::{Duration, SystemTime};

use actix_web::{get, web, HttpRequest, HttpResponse};
use serde::Serialize;

use crate::admission::{admit, client_key};
use crate::metrics::{metrics_output, REQUESTS};
use crate::state::AppState;

const DASHBOARD_HTML: &str = include_str!("dashboard.html");

/// CPU utilization sampling interval.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize)]
pub struct CpuStats {
    /// Percentage (0-100).
    pub utilization: f64,
    pub timestamp: String,
}

/// The protected endpoint: current CPU utilization.
#[get("/cpu")]
pub async fn cpu(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let admission = match admit(&req, &state).await {
        Ok(a) => a,
        Err(resp) => {
            REQUESTS
                .with_label_values(&["/cpu", resp.status().as_str()])
                .inc();
            return resp;
        }
    };
    tracing::debug!(outcome = admission.as_str(), "request admitted");

    match cpu_utilization().await {
        Ok(utilization) => {
            REQUESTS.with_label_values(&["/cpu", "200"]).inc();
            HttpResponse::Ok().json(CpuStats {
                utilization,
                timestamp: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            })
        }
        Err(e) => {
            REQUESTS.with_label_values(&["/cpu", "500"]).inc();
            tracing::error!(error = %e, "failed to read CPU stats");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({"error": "Failed to get CPU utilization"}))
        }
    }
}

/// Token introspection for the caller's bucket. Bypasses admission; used by
/// integration tests and the dashboard.
#[get("/tokens")]
pub async fn tokens(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let key = client_key(&req);
    match state.limiter.available(&key).await {
        Ok(tokens) => HttpResponse::Ok().json(serde_json::json!({
            "client": key,
            "tokens": tokens,
            "capacity": state.config.ratelimit.capacity,
        })),
        Err(e) => {
            tracing::error!(error = %e, client = %key, "token introspection failed");
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

/// Live CPU graph. Bypasses admission.
#[get("/dashboard")]
pub async fn dashboard() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(DASHBOARD_HTML)
}

#[get("/metrics")]
pub async fn metrics_endpoint() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics_output())
}

/// Sample /proc/stat twice and derive utilization from the idle delta.
async fn cpu_utilization() -> std::io::Result<f64> {
    let (idle1, total1) = read_cpu_stat()?;
    tokio::time::sleep(SAMPLE_INTERVAL).await;
    let (idle2, total2) = read_cpu_stat()?;

    let idle_delta = idle2.saturating_sub(idle1);
    let total_delta = total2.saturating_sub(total1);
    if total_delta == 0 {
        return Ok(0.0);
    }
    Ok((1.0 - idle_delta as f64 / total_delta as f64) * 100.0)
}

/// Parse the aggregate cpu line of /proc/stat into (idle, total) jiffies.
fn read_cpu_stat() -> std::io::Result<(u64, u64)> {
    let data = std::fs::read_to_string("/proc/stat")?;
    parse_cpu_line(&data).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc/stat")
    })
}

fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    // First line: cpu  user nice system idle iowait irq softirq steal ...
    let line = stat.lines().next()?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 || fields[0] != "cpu" {
        return None;
    }

    let mut idle = 0u64;
    let mut total = 0u64;
    for (i, field) in fields.iter().enumerate().skip(1) {
        let value: u64 = field.parse().unwrap_or(0);
        total += value;
        if i == 4 {
            idle = value;
        }
    }
    Some((idle, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_proc_stat() {
        let stat = "cpu  10 20 30 400 50 0 0 0 0 0\ncpu0 1 2 3 4 5 0 0 0 0 0\n";
        let (idle, total) = parse_cpu_line(stat).unwrap();
        assert_eq!(idle, 400);
        assert_eq!(total, 510);
    }

    #[test]
    fn rejects_malformed_stat() {
        assert!(parse_cpu_line("").is_none());
        assert!(parse_cpu_line("intr 12345").is_none());
        assert!(parse_cpu_line("cpu 1 2").is_none());
    }
}
