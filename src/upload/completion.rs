//! Session finalization
//!
//! Finalize either answers with the stored file or with "processing", in
//! which case the status endpoint is polled. Poll spacing grows by one step
//! per attempt up to a plateau; the attempt budget grows with file size.
//! Transient failures while polling are counted, not fatal, until too many
//! arrive in a row.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::types::UploadSession;
use crate::api::{Call, CompletionStatus, Remote, RemoteEntry};
use crate::config::{CompletionConfig, TimeoutConfig};
use crate::error::{ErrorCategory, Result, TransferError};
use crate::pacer::endpoint;

pub struct Finalizer {
    remote: Arc<Remote>,
    config: CompletionConfig,
    timeouts: TimeoutConfig,
}

impl Finalizer {
    pub fn new(remote: Arc<Remote>, config: CompletionConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            remote,
            config,
            timeouts,
        }
    }

    pub async fn complete(&self, session: &UploadSession, cancel: &CancellationToken) -> Result<RemoteEntry> {
        let session_id = session.id.as_str();
        let call = Call::new(
            endpoint::COMPLETE,
            "complete",
            &session.remote_path,
            self.timeouts.metadata,
        )
        .cancel(cancel);

        let status = self
            .remote
            .call(call, |api, cred| async move { api.complete_session(&cred, session_id).await })
            .await?;

        match status {
            CompletionStatus::Complete { file } => Ok(file),
            CompletionStatus::Failed { error } => Err(TransferError::CompletionFailed {
                session_id: session.id.clone(),
                message: error,
            }),
            CompletionStatus::Processing => self.poll(session, cancel).await,
        }
    }

    async fn poll(&self, session: &UploadSession, cancel: &CancellationToken) -> Result<RemoteEntry> {
        let session_id = session.id.as_str();
        let max_polls = self.config.max_polls_for(session.size);
        let mut network_failures = 0u32;

        tracing::info!(
            session_id,
            file_size = session.size,
            max_polls,
            "Provider is assembling file, polling"
        );

        for attempt in 1..=max_polls {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransferError::cancelled("complete", session.remote_path.clone()));
                }
                _ = tokio::time::sleep(self.config.poll_delay(attempt)) => {}
            }

            let call = Call::new(
                endpoint::POLL_STATUS,
                "poll_status",
                &session.remote_path,
                self.timeouts.metadata,
            )
            .cancel(cancel)
            .single_attempt();

            let outcome = self
                .remote
                .call(call, |api, cred| async move { api.session_status(&cred, session_id).await })
                .await;

            match outcome {
                Ok(CompletionStatus::Complete { file }) => {
                    tracing::debug!(session_id, attempt, "Completion confirmed");
                    return Ok(file);
                }
                Ok(CompletionStatus::Failed { error }) => {
                    return Err(TransferError::CompletionFailed {
                        session_id: session.id.clone(),
                        message: error,
                    });
                }
                Ok(CompletionStatus::Processing) => {
                    network_failures = 0;
                }
                Err(e) if is_transient(&e) => {
                    network_failures += 1;
                    if network_failures > self.config.max_network_failures {
                        return Err(e);
                    }
                    tracing::debug!(session_id, attempt, network_failures, error = %e, "Status poll failed");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TransferError::CompletionTimeout {
            session_id: session.id.clone(),
            attempts: max_polls,
        })
    }
}

/// Failures that say nothing about the session itself
fn is_transient(error: &TransferError) -> bool {
    matches!(
        error.category(),
        ErrorCategory::NetworkTimeout | ErrorCategory::ServerOverload | ErrorCategory::RateLimit
    )
}
