use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisResult};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::error::{RateLimitError, Result};

/// The slice of store functionality the distributed limiter relies on:
/// content-addressed scripts evaluated atomically against keys.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Number of endpoints a script must be present on
    fn endpoint_count(&self) -> usize;

    /// Whether `endpoint` already caches a script with this digest
    async fn script_exists(&self, endpoint: usize, digest: &str) -> Result<bool>;

    /// Load `source` into `endpoint`, returning the digest the store assigned
    async fn script_load(&self, endpoint: usize, source: &str) -> Result<String>;

    /// Evaluate a cached script by digest
    async fn eval_script(&self, digest: &str, keys: &[&str], args: &[i64]) -> Result<Vec<i64>>;

    async fn health_check(&self) -> Result<()>;
}

/// Redis client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Split a store address into its endpoint URLs.
pub fn parse_endpoints(address: &str) -> Result<Vec<String>> {
    let endpoints: Vec<String> = address
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect();

    if endpoints.is_empty() {
        return Err(RateLimitError::Config(
            "Store address contains no endpoints".to_string(),
        ));
    }

    Ok(endpoints)
}

/// One connected Redis endpoint
#[derive(Clone)]
struct RedisEndpoint {
    url: String,
    connection: ConnectionManager,
}

/// Redis-backed script store. Scripts are loaded on every endpoint and
/// evaluated on the first one.
#[derive(Clone)]
pub struct RedisStore {
    endpoints: Vec<RedisEndpoint>,
    config: RedisConfig,
}

impl RedisStore {
    /// Connect to every endpoint listed in `address`.
    ///
    /// Fails if any endpoint cannot be reached or does not answer `PING`.
    pub async fn connect(address: &str, config: RedisConfig) -> Result<Self> {
        let mut endpoints = Vec::new();
        for url in parse_endpoints(address)? {
            endpoints.push(Self::connect_endpoint(url, &config).await?);
        }

        info!("Redis store initialized with {} endpoint(s)", endpoints.len());
        Ok(Self { endpoints, config })
    }

    async fn connect_endpoint(url: String, config: &RedisConfig) -> Result<RedisEndpoint> {
        info!("Creating Redis client for URL: {}", url);

        let client = redis::Client::open(url.as_str()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection_result =
            tokio::time::timeout(config.connection_timeout, client.get_connection_manager()).await;

        let connection = match connection_result {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(RateLimitError::Store(format!(
                    "Timeout while connecting to {}",
                    url
                )));
            }
        };

        let endpoint = RedisEndpoint { url, connection };
        let mut conn = endpoint.connection.clone();
        Self::with_timeout(
            config.command_timeout,
            "PING",
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await?;

        info!("Redis endpoint {} ready", endpoint.url);
        Ok(endpoint)
    }

    async fn with_timeout<T>(
        timeout: Duration,
        command: &str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Store(format!(
                "Redis {} timed out after {}ms",
                command,
                timeout.as_millis()
            ))),
        }
    }

    fn endpoint(&self, index: usize) -> Result<&RedisEndpoint> {
        self.endpoints.get(index).ok_or_else(|| {
            RateLimitError::Store(format!(
                "Endpoint {} out of range ({} configured)",
                index,
                self.endpoints.len()
            ))
        })
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn script_exists(&self, endpoint: usize, digest: &str) -> Result<bool> {
        let mut conn = self.endpoint(endpoint)?.connection.clone();
        let exists: Vec<bool> = Self::with_timeout(
            self.config.command_timeout,
            "SCRIPT EXISTS",
            redis::cmd("SCRIPT")
                .arg("EXISTS")
                .arg(digest)
                .query_async(&mut conn),
        )
        .await?;

        Ok(exists.first().copied().unwrap_or(false))
    }

    async fn script_load(&self, endpoint: usize, source: &str) -> Result<String> {
        let mut conn = self.endpoint(endpoint)?.connection.clone();
        Self::with_timeout(
            self.config.command_timeout,
            "SCRIPT LOAD",
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn),
        )
        .await
    }

    async fn eval_script(&self, digest: &str, keys: &[&str], args: &[i64]) -> Result<Vec<i64>> {
        let mut conn = self.endpoint(0)?.connection.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(digest).arg(keys.len()).arg(keys).arg(args);

        Self::with_timeout(self.config.command_timeout, "EVALSHA", cmd.query_async(&mut conn)).await
    }

    async fn health_check(&self) -> Result<()> {
        for endpoint in &self.endpoints {
            let mut conn = endpoint.connection.clone();
            Self::with_timeout(
                self.config.command_timeout,
                "PING",
                redis::cmd("PING").query_async::<_, ()>(&mut conn),
            )
            .await?;
        }
        Ok(())
    }
}
