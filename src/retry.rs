// src/retry.rs
use std::future::Future;
use std::time::Duration;

use crate::error::LedgerError;

const DEADLOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Rerun `f` until it returns anything other than a store deadlock.
/// There is no attempt cap; cancellation is dropping the returned future,
/// which also aborts the in-flight attempt and rolls its transaction back.
pub async fn retry_on_deadlock<T, F, Fut>(mut f: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    loop {
        match f().await {
            Err(err) if err.is_deadlock() => {
                tracing::debug!("store deadlock, retrying");
                tokio::time::sleep(DEADLOCK_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_deadlock_clears() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_deadlock(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(LedgerError::from(StoreError::Deadlock))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_deadlock(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::AlreadyPerformed)
        })
        .await;

        assert!(matches!(result, Err(LedgerError::AlreadyPerformed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
