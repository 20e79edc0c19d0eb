use moka::future::Cache;
use std::{future::Future, time::Duration};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::error::{RateLimitError, Result};

/// Acquire `mutex`, giving up if `cancel` fires first.
///
/// The tokio mutex is fair, so contending callers are admitted in the
/// order they started waiting.
pub async fn lock_or_cancel<'a, T>(
    mutex: &'a Mutex<T>,
    cancel: &CancellationToken,
) -> Result<MutexGuard<'a, T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RateLimitError::Cancelled),
        guard = mutex.lock() => Ok(guard),
    }
}

/// Suspend for `wait` unless `cancel` fires first.
pub async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<()> {
    if wait.is_zero() {
        return Ok(());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RateLimitError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

/// Return the cached value for `key`, building it with `init` if absent.
///
/// Concurrent callers for one missing key share a single `init`. The caller
/// whose `init` ran gets its error back unchanged; callers that waited on it
/// get [`RateLimitError::Init`]. Failures are not cached.
pub async fn get_or_try_build<V, F>(cache: &Cache<String, V>, key: &str, init: F) -> Result<V>
where
    V: Clone + Send + Sync + 'static,
    F: Future<Output = Result<V>>,
{
    let mut failure = None;
    let outcome = cache
        .try_get_with(key.to_string(), async {
            init.await.map_err(|e| {
                let message = e.to_string();
                failure = Some(e);
                message
            })
        })
        .await;

    outcome.map_err(|shared| {
        failure
            .take()
            .unwrap_or_else(|| RateLimitError::Init(shared.as_str().to_string()))
    })
}

/// When a store-side window or lock expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTime {
    /// The key carries no expiry
    Never,
    /// The key was already gone when its TTL was read
    Expired,
    At(Instant),
}

impl ResetTime {
    /// Interpret a Redis `PTTL`-style reply: `-1` means no expiry, other
    /// negatives mean the key has already expired.
    pub fn from_ttl_ms(ttl_ms: i64, now: Instant) -> Self {
        if ttl_ms >= 0 {
            ResetTime::At(now + Duration::from_millis(ttl_ms as u64))
        } else if ttl_ms == -1 {
            ResetTime::Never
        } else {
            ResetTime::Expired
        }
    }

    /// Time left until the reset, `Duration::MAX` if it never comes.
    pub fn wait_from(&self, now: Instant) -> Duration {
        match self {
            ResetTime::Never => Duration::MAX,
            ResetTime::Expired => Duration::ZERO,
            ResetTime::At(at) => at.saturating_duration_since(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_build_error_returned_unchanged() {
        let cache: Cache<String, u32> = Cache::builder().build();

        let err = get_or_try_build(&cache, "k", async {
            Err(RateLimitError::Config("bad".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RateLimitError::Config(msg) if msg == "bad"));

        let value = get_or_try_build(&cache, "k", async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
        assert_eq!(get_or_try_build(&cache, "k", async { Ok(1) }).await.unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_build_failure() {
        let cache: Arc<Cache<String, u32>> = Arc::new(Cache::builder().build());
        let release = Arc::new(Notify::new());

        let leader = {
            let cache = cache.clone();
            let release = release.clone();
            tokio::spawn(async move {
                get_or_try_build(&cache, "k", async move {
                    release.notified().await;
                    Err(RateLimitError::Store("connection refused".to_string()))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { get_or_try_build(&cache, "k", async { Ok(7) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        release.notify_one();
        assert!(matches!(
            leader.await.unwrap(),
            Err(RateLimitError::Store(_))
        ));
        match waiter.await.unwrap() {
            Err(RateLimitError::Init(msg)) => assert!(msg.contains("connection refused")),
            other => panic!("Expected shared init failure, got {:?}", other),
        }

        // Nothing was cached, so the next caller builds again.
        assert_eq!(get_or_try_build(&cache, "k", async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        sleep_or_cancel(Duration::from_millis(300), &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = sleep_or_cancel(Duration::from_secs(10), &cancel).await;
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_lock_or_cancel() {
        let mutex = Arc::new(Mutex::new(0u32));
        let cancel = CancellationToken::new();

        {
            let mut guard = lock_or_cancel(&mutex, &cancel).await.unwrap();
            *guard += 1;
        }

        let _held = mutex.lock().await;
        cancel.cancel();
        assert!(lock_or_cancel(&mutex, &cancel).await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_time_from_ttl() {
        let now = Instant::now();
        assert_eq!(
            ResetTime::from_ttl_ms(850, now),
            ResetTime::At(now + Duration::from_millis(850))
        );
        assert_eq!(ResetTime::from_ttl_ms(-1, now), ResetTime::Never);
        assert_eq!(ResetTime::from_ttl_ms(-2, now), ResetTime::Expired);

        assert_eq!(
            ResetTime::from_ttl_ms(850, now).wait_from(now),
            Duration::from_millis(850)
        );
        assert_eq!(ResetTime::Never.wait_from(now), Duration::MAX);
        assert_eq!(ResetTime::Expired.wait_from(now), Duration::ZERO);
    }
}
