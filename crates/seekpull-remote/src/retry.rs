//! Transport-level retry: exponential backoff with jitter, per-attempt deadline.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::Url;
use seekpull_core::config::FetchConfig;
use seekpull_core::{SeekpullError, SeekpullResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::redact::redact_url;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub attempt_timeout: Duration,
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(cfg: &FetchConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            min_wait: cfg.min_wait(),
            max_wait: cfg.max_wait(),
            attempt_timeout: cfg.fetch_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based): `min_wait * 2^attempt`
    /// capped at `max_wait`, plus up to 1/8 of that as jitter.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.min_wait.saturating_mul(factor).min(self.max_wait);
        let spread = (base / 8).as_nanos() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..spread)
        };
        base + Duration::from_nanos(jitter)
    }
}

/// 429 and 5xx other than 501 are worth another attempt.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || ((500..600).contains(&status) && status != 501)
}

fn is_retryable(err: &SeekpullError) -> bool {
    match err {
        SeekpullError::Transport { status, .. } => status.map_or(true, is_retryable_status),
        _ => false,
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// retry budget runs out. Each attempt gets its own deadline.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    url: &Url,
    op: &'static str,
    mut attempt: F,
) -> SeekpullResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SeekpullResult<T>>,
{
    let mut retries = 0u32;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(SeekpullError::Cancelled),
            r = tokio::time::timeout(policy.attempt_timeout, attempt()) => match r {
                Ok(r) => r,
                Err(_) => Err(SeekpullError::Transport {
                    url: redact_url(url),
                    status: None,
                    message: format!("timed out after {:?}", policy.attempt_timeout),
                }),
            },
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if retries < policy.max_retries && is_retryable(&e) => {
                let wait = policy.backoff(retries);
                retries += 1;
                warn!(
                    op,
                    url = %redact_url(url),
                    retry = retries,
                    max_retries = policy.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SeekpullError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
