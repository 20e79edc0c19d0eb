use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{LimiterKind, RateLimitRule},
    error::{RateLimitError, Result},
    registry::{RateLimiterRegistry, DEFAULT_KEY},
};

/// Which limiter a unit of work is gated by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: LimiterKind,
    pub key: String,
    /// Rule used if the key has no limiter yet
    pub rule: Option<RateLimitRule>,
}

impl Target {
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            kind: LimiterKind::Local,
            key: key.into(),
            rule: None,
        }
    }

    pub fn distributed(key: impl Into<String>) -> Self {
        Self {
            kind: LimiterKind::Distributed,
            key: key.into(),
            rule: None,
        }
    }

    pub fn with_rule(mut self, rule: RateLimitRule) -> Self {
        self.rule = Some(rule);
        self
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::local(DEFAULT_KEY)
    }
}

/// Runs work once the limiter for its target admits it.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RateLimiterRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RateLimiterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RateLimiterRegistry> {
        &self.registry
    }

    /// Gate asynchronous work producing a value.
    ///
    /// Fails with `Cancelled` before touching the limiter if `cancel` has
    /// already fired, so no admission is consumed.
    pub async fn enqueue_async_value<F, Fut, T, E>(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RateLimitError>,
    {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled.into());
        }

        let limiter = self
            .registry
            .bind(target.kind, &target.key, target.rule.as_ref())
            .await?;
        limiter.run(cancel, work).await
    }

    /// Gate asynchronous work with no value.
    pub async fn enqueue_async<F, Fut, E>(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        work: F,
    ) -> std::result::Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<RateLimitError>,
    {
        self.enqueue_async_value(target, cancel, work).await
    }

    /// Gate a synchronous computation.
    pub async fn enqueue_value<F, T>(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        self.enqueue_async_value(target, cancel, || async move { Ok(work()) })
            .await
    }

    /// Gate a synchronous action.
    pub async fn enqueue<F>(&self, target: &Target, cancel: &CancellationToken, work: F) -> Result<()>
    where
        F: FnOnce(),
    {
        self.enqueue_async(target, cancel, || async move {
            work();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn dispatcher(limit: i64) -> Dispatcher {
        let registry = RateLimiterRegistry::new(RateLimitRule::new(Duration::from_secs(1), limit));
        Dispatcher::new(Arc::new(registry))
    }

    #[derive(Debug)]
    enum JobError {
        Limiter(RateLimitError),
        Failed(&'static str),
    }

    impl From<RateLimitError> for JobError {
        fn from(e: RateLimitError) -> Self {
            JobError::Limiter(e)
        }
    }

    #[tokio::test]
    async fn test_enqueue_value_returns_result() {
        let dispatcher = dispatcher(5);
        let value = dispatcher
            .enqueue_value(&Target::default(), &CancellationToken::new(), || 21 * 2)
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_enqueue_runs_action() {
        let dispatcher = dispatcher(5);
        let mut ran = false;
        dispatcher
            .enqueue(&Target::local("actions"), &CancellationToken::new(), || ran = true)
            .await
            .unwrap();
        assert!(ran);
    }

    #[tokio::test]
    async fn test_work_errors_propagate() {
        let dispatcher = dispatcher(5);
        let result: std::result::Result<(), JobError> = dispatcher
            .enqueue_async(&Target::local("jobs"), &CancellationToken::new(), || async {
                Err(JobError::Failed("boom"))
            })
            .await;

        assert!(matches!(result, Err(JobError::Failed("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_consumes_no_slot() {
        let dispatcher = dispatcher(1);
        let target = Target::local("cancel-first");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: std::result::Result<u8, JobError> = dispatcher
            .enqueue_async_value(&target, &cancel, || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(JobError::Limiter(RateLimitError::Cancelled))));

        let start = Instant::now();
        dispatcher
            .enqueue(&target, &CancellationToken::new(), || {})
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_throttles_per_key() {
        let dispatcher = dispatcher(2);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..2 {
            dispatcher.enqueue(&Target::local("a"), &cancel, || {}).await.unwrap();
            dispatcher.enqueue(&Target::local("b"), &cancel, || {}).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        dispatcher.enqueue(&Target::local("a"), &cancel, || {}).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rule_applies_to_new_key() {
        let dispatcher = dispatcher(100);
        let target = Target::local("strict")
            .with_rule(RateLimitRule::new(Duration::from_millis(500), 1));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        dispatcher.enqueue(&target, &cancel, || {}).await.unwrap();
        dispatcher.enqueue(&target, &cancel, || {}).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
