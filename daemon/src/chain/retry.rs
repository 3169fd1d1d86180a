use std::{future::Future, time::Duration};

use log::{debug, warn};
use thiserror::Error;

use crate::config::{RPC_RETRY_ATTEMPTS, RPC_RETRY_BASE_DELAY_MS, RPC_RETRY_MAX_DELAY_MS};

#[derive(Debug, Error)]
pub enum RpcClientError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcClientError {
    /// Transient faults are retried with backoff; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            // network failures and timeouts
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Rpc { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

// Exponential backoff delay for the given retry round
fn backoff_delay(round: u32) -> Duration {
    let millis = RPC_RETRY_BASE_DELAY_MS
        .saturating_mul(2u64.saturating_pow(round))
        .min(RPC_RETRY_MAX_DELAY_MS);
    Duration::from_millis(millis)
}

/// Run `op` up to `RPC_RETRY_ATTEMPTS` times, backing off between transient
/// failures. The attempt index is passed through so callers can rotate
/// across their configured RPC URLs.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, RpcClientError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, RpcClientError>>,
{
    let mut last_error = None;
    for attempt in 0..RPC_RETRY_ATTEMPTS {
        if attempt > 0 {
            let delay = backoff_delay(attempt as u32 - 1);
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Retrying {} (attempt {}/{}) after {:?}",
                    op_name,
                    attempt + 1,
                    RPC_RETRY_ATTEMPTS,
                    delay
                );
            }
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!("{} attempt {} failed: {}", op_name, attempt + 1, e);
                last_error = Some(e);
            }
            // permanent fault, no retry
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        RpcClientError::InvalidResponse(format!("{}: no attempt was made", op_name))
    }))
}
