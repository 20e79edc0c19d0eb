//! Store-backed fixed-window limiter.
//!
//! Admission decisions are made by [`FIXED_WINDOW_SCRIPT`](crate::script::FIXED_WINDOW_SCRIPT)
//! running atomically inside Redis, so any number of processes can share
//! one limit. The local mutex only keeps this process from polling the
//! store concurrently for the same key.

use async_trait::async_trait;
use moka::future::Cache;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{LimiterKind, RateLimitRule},
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    redis::{RedisConfig, RedisStore, ScriptStore},
    registry::LimiterFactory,
    script::{CheckResult, ScriptHandle},
    utils::{get_or_try_build, lock_or_cancel, sleep_or_cancel, ResetTime},
};

/// Evaluation attempts before a store error escapes to the caller
pub const MAX_EVAL_ATTEMPTS: usize = 5;

/// Cooldown applied once a window's limit is hit
const LOCK_SECONDS: i64 = 1;

/// Each admission consumes one unit
const INCREMENT: i64 = 1;

/// Limiter whose counter lives in a shared store
pub struct RedisRateLimiter {
    key: String,
    rule: RateLimitRule,
    store: Arc<dyn ScriptStore>,
    script: Arc<ScriptHandle>,
    lock: Mutex<()>,
}

impl RedisRateLimiter {
    pub fn new(
        rule: RateLimitRule,
        key: impl Into<String>,
        store: Arc<dyn ScriptStore>,
        script: Arc<ScriptHandle>,
    ) -> Self {
        Self {
            key: key.into(),
            rule,
            store,
            script,
            lock: Mutex::new(()),
        }
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    fn script_args(&self) -> [i64; 4] {
        [INCREMENT, self.rule.window_ms(), self.rule.limit, LOCK_SECONDS]
    }

    /// Run the script once and translate its reply.
    pub async fn check(&self) -> Result<CheckResult> {
        let reply = self.evaluate().await?;
        CheckResult::from_reply(&reply, self.rule.limit, Instant::now())
    }

    /// Evaluate the script, reloading it when the store has lost it.
    async fn evaluate(&self) -> Result<Vec<i64>> {
        let args = self.script_args();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.script.load(self.store.as_ref()).await {
                Ok(digest) => self.store.eval_script(&digest, &[self.key.as_str()], &args).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < MAX_EVAL_ATTEMPTS && e.is_retryable_store_error() => {
                    warn!(
                        key = %self.key,
                        attempt,
                        error = %e,
                        "Script evaluation failed, retrying"
                    );
                    if e.is_stale_script() {
                        self.script.invalidate();
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait derived from a limited check, bounded by one window when the
    /// store reports no expiry at all.
    fn wait_for(&self, result: &CheckResult) -> Duration {
        match result.reset {
            ResetTime::Never => self.rule.window,
            _ => result.wait,
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn invoke(&self, cancel: &CancellationToken) -> Result<()> {
        if self.rule.is_unlimited() {
            return Ok(());
        }

        let _guard = lock_or_cancel(&self.lock, cancel).await?;

        loop {
            let result = self.check().await?;
            if !result.limited {
                trace!(key = %self.key, count = result.count, "Distributed admission granted");
                return Ok(());
            }

            let wait = self.wait_for(&result);
            debug!(
                key = %self.key,
                count = result.count,
                remaining = result.remaining,
                wait_ms = wait.as_millis() as u64,
                "Distributed limit reached, waiting for reset"
            );
            sleep_or_cancel(wait, cancel).await?;
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> LimiterKind {
        LimiterKind::Distributed
    }
}

/// A store connection together with the script cached on it
#[derive(Clone)]
struct StoreBinding {
    store: Arc<dyn ScriptStore>,
    script: Arc<ScriptHandle>,
}

impl StoreBinding {
    fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self {
            store,
            script: Arc::new(ScriptHandle::fixed_window()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    fn limiter(&self, rule: &RateLimitRule, key: &str) -> Arc<dyn RateLimiter> {
        Arc::new(RedisRateLimiter::new(
            rule.clone(),
            key,
            self.store.clone(),
            self.script.clone(),
        ))
    }
}

/// Builds distributed limiters, connecting once per store address.
pub struct RedisLimiterFactory {
    config: RedisConfig,
    stores: Cache<String, StoreBinding>,
}

impl RedisLimiterFactory {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            stores: Cache::builder().build(),
        }
    }

    async fn binding(&self, address: &str) -> Result<StoreBinding> {
        get_or_try_build(&self.stores, address, async {
            info!("Connecting distributed limiter store at {}", address);
            let store = RedisStore::connect(address, self.config.clone()).await?;
            Ok(StoreBinding::new(Arc::new(store)))
        })
        .await
    }

    /// Connect to `address` if needed and ping every endpoint.
    ///
    /// The connection is kept and reused by limiters bound to the same
    /// address afterwards.
    pub async fn health_check(&self, address: &str) -> Result<()> {
        self.binding(address).await?.health_check().await
    }
}

impl Default for RedisLimiterFactory {
    fn default() -> Self {
        Self::new(RedisConfig::default())
    }
}

#[async_trait]
impl LimiterFactory for RedisLimiterFactory {
    async fn create(&self, rule: &RateLimitRule, key: &str) -> Result<Arc<dyn RateLimiter>> {
        let address = rule.store_url.as_deref().ok_or_else(|| {
            RateLimitError::Config("Distributed limiter requires a store_url".to_string())
        })?;

        let binding = self.binding(address).await?;
        Ok(binding.limiter(rule, key))
    }
}

/// Builds distributed limiters over a store the caller already owns.
pub struct StoreLimiterFactory {
    binding: StoreBinding,
}

impl StoreLimiterFactory {
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self {
            binding: StoreBinding::new(store),
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.binding.health_check().await
    }
}

#[async_trait]
impl LimiterFactory for StoreLimiterFactory {
    async fn create(&self, rule: &RateLimitRule, key: &str) -> Result<Arc<dyn RateLimiter>> {
        Ok(self.binding.limiter(rule, key))
    }
}
