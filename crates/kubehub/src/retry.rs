//! Bounded retry for cluster writes that lose an optimistic-concurrency race.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles each time.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { retries: 5, backoff: Duration::from_millis(50) }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let retries = std::env::var("NIMBUS_CONFLICT_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.retries);
        let backoff = std::env::var("NIMBUS_CONFLICT_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.backoff);
        Self { retries, backoff }
    }
}

pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Run `op` until it succeeds, fails with something other than HTTP 409, or
/// the retry budget is spent. `op` should re-read the object it writes.
pub async fn retry_on_conflict<T, F, Fut>(cfg: &RetryConfig, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if is_conflict(&e) && attempt < cfg.retries => {
                let delay = cfg.backoff.saturating_mul(1u32 << attempt.min(16));
                attempt += 1;
                counter!("cluster_conflict_retries_total", 1u64);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "write conflict; retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: if code == 409 { "Conflict".into() } else { "NotFound".into() },
            code,
        })
    }

    const FAST: RetryConfig = RetryConfig { retries: 3, backoff: Duration::from_millis(1) };

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conflicts_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry_on_conflict(&FAST, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(api_err(409))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn budget_is_bounded_and_other_errors_pass_through() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = retry_on_conflict(&FAST, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(api_err(409))
        })
        .await
        .unwrap_err();
        assert!(is_conflict(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        calls.store(0, Ordering::SeqCst);
        let err = retry_on_conflict(&FAST, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(api_err(404))
        })
        .await
        .unwrap_err();
        assert!(!is_conflict(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
