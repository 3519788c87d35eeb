//! Admission-controlled resource server.
//!
//! Gates the protected endpoint behind a token-bucket rate limiter and
//! turns HTTP 402 payments into bucket refills via the facilitator.
//!
//! # Modules
//!
//! - [`config`] — YAML configuration ([`Config`](config::Config))
//! - [`admission`] — the per-request pipeline ([`admit`](admission::admit))
//! - [`handlers`] — HTTP endpoints (`/cpu`, `/tokens`, `/dashboard`, `/metrics`)
//! - [`state`] — shared application state
//! - [`metrics`] — Prometheus counters

pub mod admission;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod state;

pub use admission::{admit, client_key, Admission};
pub use config::{Config, ConfigError, Strategy};
pub use state::AppState;
