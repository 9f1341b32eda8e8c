//! Retry Classifier
//!
//! Maps a failed provider call to a category, a retry decision and a delay.
//! Every network call site goes through [`RetryPolicy`]; there is no other
//! retry loop in the crate.

use std::cmp;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{ApiError, ApiErrorKind, ErrorCategory};

/// Outcome of classifying one failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Wait before the next attempt
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        self.config.rate_limit_delay
    }

    /// Classify a failure observed on attempt `attempt` (1-based)
    pub fn classify(&self, error: &ApiError, attempt: u32) -> RetryDecision {
        let category = categorize(error);
        let retryable = match category {
            ErrorCategory::ServerOverload
            | ErrorCategory::NetworkTimeout
            | ErrorCategory::UrlExpired
            | ErrorCategory::RateLimit
            | ErrorCategory::Auth => true,
            ErrorCategory::Unknown => is_network_shaped(error),
            _ => false,
        };

        let delay = if !retryable {
            Duration::ZERO
        } else {
            match category {
                ErrorCategory::RateLimit => {
                    cmp::max(self.config.rate_limit_delay, error.retry_after.unwrap_or_default())
                }
                // Retried right after the credential refresh
                ErrorCategory::Auth => Duration::ZERO,
                _ => cmp::max(self.backoff(attempt), error.retry_after.unwrap_or_default()),
            }
        };

        RetryDecision {
            category,
            retryable,
            delay,
        }
    }

    /// Exponential backoff with equal jitter: half fixed, half random
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.config.multiplier.max(1).saturating_pow(exponent);
        let ceiling = cmp::min(
            self.config.base_delay.saturating_mul(factor),
            self.config.max_delay,
        );

        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        half + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Terminal category of a provider failure
pub fn categorize(error: &ApiError) -> ErrorCategory {
    if let Some(code) = error.code.as_deref() {
        match code {
            "RATE_LIMITED" | "TOO_MANY_REQUESTS" | "QUOTA_EXCEEDED" => {
                return ErrorCategory::RateLimit
            }
            "URL_EXPIRED" | "UPLOAD_URL_EXPIRED" => return ErrorCategory::UrlExpired,
            "TOKEN_EXPIRED" | "UNAUTHORIZED" => return ErrorCategory::Auth,
            _ => {}
        }
    }

    match error.kind {
        ApiErrorKind::Timeout | ApiErrorKind::Network => return ErrorCategory::NetworkTimeout,
        ApiErrorKind::Decode => return ErrorCategory::Unknown,
        ApiErrorKind::Http => {}
    }

    match error.status {
        Some(429) => ErrorCategory::RateLimit,
        Some(401) => ErrorCategory::Auth,
        Some(403) => ErrorCategory::Permission,
        Some(404) | Some(410) => ErrorCategory::NotFound,
        Some(409) => ErrorCategory::Conflict,
        Some(408) => ErrorCategory::NetworkTimeout,
        Some(status) if status >= 500 => ErrorCategory::ServerOverload,
        _ => ErrorCategory::Unknown,
    }
}

/// Unclassified failures that still look like a dropped connection
fn is_network_shaped(error: &ApiError) -> bool {
    let message = error.message.to_ascii_lowercase();
    [
        "connection reset",
        "connection closed",
        "broken pipe",
        "unexpected eof",
        "incomplete message",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}
