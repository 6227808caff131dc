// crates/db/src/retry.rs
//! Retry with exponential backoff for transient storage errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{DbError, DbResult};

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

/// Base delay before the first retry; doubles each retry (1 s, 2 s, 4 s).
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Maximum random jitter added to each delay.
const MAX_JITTER_MS: u64 = 1_000;

/// Run `op`, retrying transient errors up to three times with 1 s / 2 s /
/// 4 s backoff plus jitter. Permanent errors and not-found surface
/// immediately. The final transient error surfaces after the last retry.
pub async fn with_retries<T, F, Fut>(op_name: &'static str, mut op: F) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
                warn!(
                    op = op_name,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "transient storage error, backing off"
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn transient() -> DbError {
        DbError::transient("test", "connection reset")
    }

    #[tokio::test]
    async fn test_success_needs_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retries("op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: DbResult<()> = with_retries("op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DbError::permanent("test", "integrity violation"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_three_times_then_surfaces() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();
        let result: DbResult<()> = with_retries("op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(DbError::Transient { .. })));
        // Initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Base delays 1 + 2 + 4 = 7 s plus at most 1 s jitter per retry.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(15), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retries("op", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
