//! Caller-driven cancellation and deadlines.
//!
//! Both wrappers drop the inner future when they give up, which returns any connection
//! it had checked out to the pool.

use crate::error::{DbError, DbResult};

use std::future::Future;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Run `fut` until it completes or `token` is cancelled.
///
/// A token that is already cancelled wins without polling `fut`.
pub async fn with_cancellation<F, T>(token: &CancellationToken, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!("Operation cancelled");
            Err(DbError::Cancelled)
        }
        result = fut => result,
    }
}

/// Run `fut` with a deadline.
pub async fn with_timeout<F, T>(limit: Duration, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            let elapsed_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(elapsed_ms, "Operation timed out");
            Err(DbError::Timeout { elapsed_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Sets its flag when dropped, standing in for a checked-out connection.
    struct Guard(Arc<AtomicBool>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_completed_future_passes_through() {
        let token = CancellationToken::new();
        let value = with_cancellation(&token, async { Ok::<_, DbError>(39) }).await.unwrap();
        assert_eq!(value, 39);

        let err = with_cancellation(&token, async { Err::<i32, _>(DbError::connection("down")) })
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let err = with_cancellation(&token, async { Ok::<_, DbError>(1) }).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_releases_held_resources() {
        let token = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));

        let guard = Guard(released.clone());
        let pending = async move {
            let _held = guard;
            std::future::pending::<()>().await;
            Ok::<_, DbError>(())
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = with_cancellation(&token, pending).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = with_timeout(Duration::from_millis(20), async {
            std::future::pending::<()>().await;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Timeout { elapsed_ms: 20 }));

        let ok = with_timeout(Duration::from_secs(1), async { Ok::<_, DbError>("done") }).await;
        assert_eq!(ok.unwrap(), "done");
    }
}
