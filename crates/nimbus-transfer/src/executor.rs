//! Bounded retry around a single remote call.

use std::future::Future;
use std::time::Duration;

use nimbus_core::config::TransferConfig;
use nimbus_core::{NimbusError, NimbusResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs remote calls with linear backoff on transport failures.
///
/// Only [`NimbusError::Network`] is retried. Insecure transport, API and
/// crypto errors are returned as-is. Anything that fails after cancellation
/// was requested is reported as [`NimbusError::Canceled`].
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    retry_enabled: bool,
    max_retries: u32,
    base_delay: Duration,
}

impl RequestExecutor {
    pub fn new(retry_enabled: bool, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            retry_enabled,
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.retry_enabled,
            config.max_retries,
            config.retry_base_delay(),
        )
    }

    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> NimbusResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(NimbusError::Canceled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NimbusError::Canceled),
                r = op() => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(_) if cancel.is_cancelled() => return Err(NimbusError::Canceled),
                Err(NimbusError::Network(msg))
                    if self.retry_enabled && attempt < self.max_retries =>
                {
                    attempt += 1;
                    let delay = self.base_delay * attempt;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %msg, "network error, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(NimbusError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if let NimbusError::InsecureTransport(_) = &e {
                        debug!("insecure transport, not retrying");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RequestExecutor {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}
