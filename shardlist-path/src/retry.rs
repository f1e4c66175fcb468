use std::future::Future;
use std::time::Duration;

use rand::Rng;
use shardlist_config::CONFIG;

use crate::error::{PathError, Result};

/// Whether an `object_store` error is worth another attempt. Logical
/// failures (missing path, existing path, failed precondition) never are.
fn is_transient(err: &object_store::Error) -> bool {
    matches!(
        err,
        object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
    )
}

fn backoff(attempt: u32) -> Duration {
    let base = CONFIG.retry_base_ms.saturating_mul(1u64 << attempt.min(8));
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Run `op`, retrying transient backend failures with bounded, jittered
/// exponential backoff.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, path: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, object_store::Error>>,
{
    let attempts = CONFIG.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if is_transient(&err) && attempt + 1 < attempts => {
                let delay = backoff(attempt);
                tracing::warn!(
                    "transient failure during {what} at '{path}' (attempt {}): {err}; \
                     retrying in {:?}",
                    attempt + 1,
                    delay,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(PathError::from_store(path, err)),
        }
    }
}
