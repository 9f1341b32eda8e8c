//! Unified provider call site
//!
//! Each attempt: refresh credentials if needed, wait for the endpoint's
//! pacer, run the call under its own timeout and the caller's cancellation
//! token, then feed the outcome back to the pacer and the retry policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ApiResult, Credential, CredentialProvider, StorageApi};
use crate::error::{ApiError, ErrorCategory, Result, TransferError};
use crate::pacer::PacerRegistry;
use crate::retry::RetryPolicy;

/// Description of one logical provider call
#[derive(Clone, Copy)]
pub struct Call<'a> {
    /// Endpoint name, used for pacer lookup
    pub endpoint: &'static str,
    /// Operation name reported in errors
    pub op: &'a str,
    /// Affected path or identifier reported in errors
    pub target: &'a str,
    /// Budget for a single attempt
    pub timeout: Duration,
    pub cancel: Option<&'a CancellationToken>,
    /// Report the first failure instead of retrying; an auth failure still
    /// gets its credential refresh
    pub single_attempt: bool,
}

impl<'a> Call<'a> {
    pub fn new(endpoint: &'static str, op: &'a str, target: &'a str, timeout: Duration) -> Self {
        Self {
            endpoint,
            op,
            target,
            timeout,
            cancel: None,
            single_attempt: false,
        }
    }

    pub fn cancel(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn single_attempt(mut self) -> Self {
        self.single_attempt = true;
        self
    }
}

pub struct Remote {
    api: Arc<dyn StorageApi>,
    credentials: Arc<dyn CredentialProvider>,
    pacers: PacerRegistry,
    retry: RetryPolicy,
}

impl Remote {
    pub fn new(
        api: Arc<dyn StorageApi>,
        credentials: Arc<dyn CredentialProvider>,
        pacers: PacerRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            credentials,
            pacers,
            retry,
        }
    }

    pub fn pacers(&self) -> &PacerRegistry {
        &self.pacers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `f` until it succeeds, fails terminally, or attempts run out
    pub async fn call<T, F, Fut>(&self, call: Call<'_>, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StorageApi>, Credential) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let max_attempts = if call.single_attempt {
            1
        } else {
            self.retry.max_attempts()
        };
        let mut refreshed = false;
        let mut attempt = 0u32;

        let mut credential = self
            .credentials
            .ensure_valid()
            .await
            .map_err(|e| terminal(&call, ErrorCategory::Auth, 1, e))?;

        loop {
            attempt += 1;

            let pacer = tokio::select! {
                _ = cancelled(call.cancel) => return Err(TransferError::cancelled(call.op, call.target)),
                pacer = self.pacers.acquire(call.endpoint) => pacer,
            };

            let outcome = tokio::select! {
                _ = cancelled(call.cancel) => return Err(TransferError::cancelled(call.op, call.target)),
                result = tokio::time::timeout(call.timeout, f(self.api.clone(), credential.clone())) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ApiError::timeout(format!(
                            "{} exceeded {}ms",
                            call.op,
                            call.timeout.as_millis()
                        ))),
                    }
                }
            };

            let error = match outcome {
                Ok(value) => {
                    pacer.success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            let decision = self.retry.classify(&error, attempt);
            match decision.category {
                ErrorCategory::RateLimit => pacer.rate_limited(decision.delay),
                ErrorCategory::ServerOverload => pacer.backoff(),
                _ => {}
            }

            // One forced refresh after an auth failure, even past the attempt cap
            let refresh_due = decision.category == ErrorCategory::Auth && !refreshed;
            let auth_exhausted = decision.category == ErrorCategory::Auth && refreshed;
            if !decision.retryable || auth_exhausted || (attempt >= max_attempts && !refresh_due) {
                return Err(terminal(&call, decision.category, attempt, error));
            }

            tracing::warn!(
                op = call.op,
                target = call.target,
                attempt,
                category = %decision.category,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "Retrying provider call"
            );

            if decision.category == ErrorCategory::Auth {
                refreshed = true;
                credential = self
                    .credentials
                    .force_refresh()
                    .await
                    .map_err(|e| terminal(&call, ErrorCategory::Auth, attempt, e))?;
                continue;
            }

            tokio::select! {
                _ = cancelled(call.cancel) => return Err(TransferError::cancelled(call.op, call.target)),
                _ = tokio::time::sleep(decision.delay) => {}
            }

            credential = self
                .credentials
                .ensure_valid()
                .await
                .map_err(|e| terminal(&call, ErrorCategory::Auth, attempt, e))?;
        }
    }
}

fn terminal(call: &Call<'_>, category: ErrorCategory, attempts: u32, source: ApiError) -> TransferError {
    TransferError::Api {
        op: call.op.to_string(),
        target: call.target.to_string(),
        category,
        attempts,
        source,
    }
}

/// Resolves when the token fires; never resolves without one
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
