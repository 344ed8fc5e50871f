use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;

use crate::external::ExternalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionAction {
    DropCandidate,
}

/// Retry, timeout and exhaustion rules applied to every external call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicy {
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub on_exhaustion: ExhaustionAction,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            timeout_ms: 10_000,
            on_exhaustion: ExhaustionAction::DropCandidate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub attempts: u32,
    pub action: ExhaustionAction,
    pub last_error: ExternalError,
}

impl CallPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Runs `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. A timeout counts as a transient failure.
    pub async fn call<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<(T, u32), CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let max_attempts = self.max_retries + 1;
        let mut attempts = 0_u32;

        loop {
            attempts += 1;
            let outcome = match timeout(self.timeout(), operation()).await {
                Ok(result) => result,
                Err(_) => Err(ExternalError::Transient(format!(
                    "timed out after {} ms",
                    self.timeout_ms
                ))),
            };

            match outcome {
                Ok(value) => return Ok((value, attempts)),
                Err(err) if err.is_transient() && attempts < max_attempts => {
                    warn!(call = label, attempt = attempts, error = %err, "retrying external call");
                }
                Err(err) => {
                    return Err(CallFailure {
                        attempts,
                        action: self.on_exhaustion,
                        last_error: err,
                    });
                }
            }
        }
    }
}
