use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{JobError, Result};

/// A single network attempt bounded by a timeout and a cancellation token.
///
/// The attempt future is dropped as soon as the token fires or the timeout
/// elapses, which aborts the underlying HTTP exchange. There are no retries.
#[derive(Debug, Clone)]
pub struct CancellableRequest {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CancellableRequest {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run<F, Fut, T>(&self, request_fn: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let attempt = tokio::time::timeout(self.timeout, request_fn());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Request aborted by cancellation");
                Err(JobError::Cancelled)
            }
            outcome = attempt => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(JobError::TimedOut(_))) | Err(_) => {
                    debug!(timeout_secs = self.timeout.as_secs(), "Request timed out");
                    Err(JobError::TimedOut(self.timeout))
                }
                Ok(Err(err)) => Err(err),
            },
        }
    }
}
