use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::{
    config::LimiterKind,
    error::{RateLimitError, Result},
};

/// A gate that blocks the caller until it may proceed for one key.
///
/// Implementations serialize their own decisions; different instances
/// never coordinate with each other.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until an admission is granted.
    ///
    /// Returns `RateLimitError::Cancelled` if `cancel` fires while waiting,
    /// in which case no admission is recorded.
    async fn invoke(&self, cancel: &CancellationToken) -> Result<()>;

    /// Key this gate was bound to
    fn key(&self) -> &str;

    fn kind(&self) -> LimiterKind;
}

impl<'a> dyn RateLimiter + 'a {
    /// Run `work` once the gate admits the caller.
    ///
    /// A token that is already cancelled fails before any admission is
    /// consumed. Errors from `work` are returned untouched.
    pub async fn run<F, Fut, T, E>(&self, cancel: &CancellationToken, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RateLimitError>,
    {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled.into());
        }

        self.invoke(cancel).await?;
        work().await
    }
}
