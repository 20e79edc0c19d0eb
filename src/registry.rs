use async_trait::async_trait;
use moka::future::Cache;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::{
    config::{LimiterKind, RateLimitRule, RateLimiterSettings},
    distributed::RedisLimiterFactory,
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    local::LocalRateLimiter,
    redis::RedisConfig,
    utils::get_or_try_build,
};

/// Key used when callers do not name one
pub const DEFAULT_KEY: &str = "RateLimiter_default_key";

/// Builds a limiter of one kind for a key.
#[async_trait]
pub trait LimiterFactory: Send + Sync {
    async fn create(&self, rule: &RateLimitRule, key: &str) -> Result<Arc<dyn RateLimiter>>;
}

/// Builds in-process limiters
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLimiterFactory;

#[async_trait]
impl LimiterFactory for LocalLimiterFactory {
    async fn create(&self, rule: &RateLimitRule, key: &str) -> Result<Arc<dyn RateLimiter>> {
        Ok(Arc::new(LocalRateLimiter::new(rule.clone(), key)))
    }
}

/// Maps keys to lazily built limiters, at most one per key.
///
/// Entries are never evicted.
pub struct RateLimiterRegistry {
    limiters: Cache<String, Arc<dyn RateLimiter>>,
    default_limiter: Arc<dyn RateLimiter>,
    default_rule: RateLimitRule,
    rules: HashMap<String, RateLimitRule>,
    factories: HashMap<LimiterKind, Arc<dyn LimiterFactory>>,
}

impl RateLimiterRegistry {
    /// Registry that can only build local limiters
    pub fn new(default_rule: RateLimitRule) -> Self {
        let default_limiter: Arc<dyn RateLimiter> =
            Arc::new(LocalRateLimiter::new(default_rule.clone(), DEFAULT_KEY));

        let mut factories: HashMap<LimiterKind, Arc<dyn LimiterFactory>> = HashMap::new();
        factories.insert(LimiterKind::Local, Arc::new(LocalLimiterFactory));

        Self {
            limiters: Cache::builder().build(),
            default_limiter,
            default_rule,
            rules: HashMap::new(),
            factories,
        }
    }

    /// Registry that also builds Redis-backed limiters
    pub fn with_redis(default_rule: RateLimitRule, config: RedisConfig) -> Self {
        Self::new(default_rule)
            .with_factory(LimiterKind::Distributed, Arc::new(RedisLimiterFactory::new(config)))
    }

    /// Registry configured from loaded settings
    pub fn from_settings(settings: &RateLimiterSettings) -> Self {
        Self::with_redis(settings.default_rule.clone(), (&settings.redis).into())
            .with_rules(settings.rules.clone())
    }

    /// Replace the factory used for `kind`.
    pub fn with_factory(mut self, kind: LimiterKind, factory: Arc<dyn LimiterFactory>) -> Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Rules applied to specific keys when `bind` gets no explicit rule
    pub fn with_rules(mut self, rules: HashMap<String, RateLimitRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn default_rule(&self) -> &RateLimitRule {
        &self.default_rule
    }

    /// Return the limiter for `key`, building it with `kind` on first use.
    ///
    /// The rule is taken from `rule`, else the per-key rules, else the
    /// default rule. Concurrent first binds of one key share a single
    /// construction and all receive the same instance. The default key
    /// always resolves to the local limiter built from the default rule.
    pub async fn bind(
        &self,
        kind: LimiterKind,
        key: &str,
        rule: Option<&RateLimitRule>,
    ) -> Result<Arc<dyn RateLimiter>> {
        if key == DEFAULT_KEY {
            return Ok(self.default_limiter.clone());
        }

        if let Some(limiter) = self.limiters.get(key).await {
            return Ok(limiter);
        }

        let rule = rule
            .or_else(|| self.rules.get(key))
            .unwrap_or(&self.default_rule)
            .clone();
        rule.validate(kind)?;

        let factory = self.factories.get(&kind).cloned().ok_or_else(|| {
            RateLimitError::Config(format!("No limiter factory registered for {}", kind))
        })?;

        get_or_try_build(&self.limiters, key, async {
            debug!(key = %key, kind = %kind, limit = rule.limit, "Creating limiter");
            factory.create(&rule, key).await
        })
        .await
    }

    /// Limiter behind the default key
    pub fn default_limiter(&self) -> Arc<dyn RateLimiter> {
        self.default_limiter.clone()
    }

    /// Number of keys bound so far, excluding the default key
    pub async fn len(&self) -> u64 {
        self.limiters.run_pending_tasks().await;
        self.limiters.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
