//! Utility helpers used by all collectors.
//!
//! This module contains:
//! - Rate text normalization
//! - HTTP client construction (fixed identification header)
//! - Time helpers
//!
//! IMPORTANT:
//! - No bank-specific business logic should live here.
//!
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use rust_decimal::Decimal;

use crate::config::HttpConfig;

/// Parse a rate cell into a positive decimal.
///
/// Everything except ASCII digits and `.` is stripped first, so
/// thousands separators, currency symbols and stray whitespace
/// do not matter.
///
/// Examples:
/// - "83.25"      -> Some(83.25)
/// - " ₹ 83.25 "  -> Some(83.25)
/// - "1,083.10"   -> Some(1083.10)
/// - "N/A"        -> None
/// - "0.00"       -> None
///
pub fn parse_rate(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        return None;
    }

    let value: Decimal = cleaned.parse().ok()?;
    (value > Decimal::ZERO).then_some(value)
}

/// Current wall-clock instant with the local offset.
pub fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Build the shared HTTP client for stateless collectors.
///
/// Every outbound request carries the configured User-Agent.
pub fn build_http_client(cfg: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(Duration::from_secs(cfg.request_timeout_secs))
        .build()
}
