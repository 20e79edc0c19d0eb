//! Server-side scripts and the replies they produce.

use std::{
    sync::{Mutex, PoisonError, RwLock},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{RateLimitError, Result},
    redis::ScriptStore,
    utils::ResetTime,
};

/// Fixed-window counter with a cooldown lock sub-key.
///
/// Must run atomically on the store; the reply is `[limited, count, ttl_ms]`.
pub const FIXED_WINDOW_SCRIPT: &str = include_str!("lua/fixed_window.lua");

pub const FIXED_WINDOW_SCRIPT_NAME: &str = "Src-IncrWithExpireSec";

/// Invalidations closer together than this are ignored.
const RELOAD_FLOOR: Duration = Duration::from_secs(1);

/// A script cached on the store and addressed by its SHA1 digest.
pub struct ScriptHandle {
    name: String,
    source: String,
    digest: RwLock<Option<String>>,
    load_lock: tokio::sync::Mutex<()>,
    last_reset: Mutex<Option<Instant>>,
}

impl ScriptHandle {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            digest: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            last_reset: Mutex::new(None),
        }
    }

    pub fn fixed_window() -> Self {
        Self::new(FIXED_WINDOW_SCRIPT_NAME, FIXED_WINDOW_SCRIPT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lowercase hex SHA1 of the source, as Redis computes it.
    pub fn compute_digest(&self) -> String {
        redis::Script::new(&self.source).get_hash().to_string()
    }

    /// Digest currently treated as loaded, if any
    pub fn cached_digest(&self) -> Option<String> {
        self.digest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make sure every endpoint of `store` has the script and return its digest.
    ///
    /// The digest is only cached once all endpoints confirmed the script.
    pub async fn load(&self, store: &dyn ScriptStore) -> Result<String> {
        if let Some(digest) = self.cached_digest() {
            return Ok(digest);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(digest) = self.cached_digest() {
            return Ok(digest);
        }

        let digest = self.compute_digest();
        for endpoint in 0..store.endpoint_count() {
            if store.script_exists(endpoint, &digest).await? {
                continue;
            }

            let loaded = store.script_load(endpoint, &self.source).await?;
            if !loaded.eq_ignore_ascii_case(&digest) {
                return Err(RateLimitError::Store(format!(
                    "Script {} loaded as {} but expected {}",
                    self.name, loaded, digest
                )));
            }
            debug!(script = %self.name, endpoint, "Loaded script into store");
        }

        *self.digest.write().unwrap_or_else(PoisonError::into_inner) = Some(digest.clone());
        Ok(digest)
    }

    /// Forget the cached digest so the next `load` pushes the script again.
    ///
    /// Returns false when an invalidation already happened within the last
    /// second, in which case nothing changes.
    pub fn invalidate(&self) -> bool {
        let mut last_reset = self.last_reset.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if matches!(*last_reset, Some(at) if now.duration_since(at) <= RELOAD_FLOOR) {
            return false;
        }

        warn!(script = %self.name, "Invalidating cached script digest");
        *self.digest.write().unwrap_or_else(PoisonError::into_inner) = None;
        *last_reset = Some(now);
        true
    }
}

/// Outcome of one fixed-window script evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// The caller must wait before retrying
    pub limited: bool,
    /// Admissions counted in the current window (`-1` while the cooldown lock is held)
    pub count: i64,
    /// `limit - count`, so `limit + 1` while the cooldown lock is held
    pub remaining: i64,
    pub reset: ResetTime,
    /// Time until `reset`
    pub wait: Duration,
}

impl CheckResult {
    /// Translate a raw `[limited, count, ttl_ms]` reply.
    pub fn from_reply(reply: &[i64], limit: i64, now: Instant) -> Result<Self> {
        let [limited, count, ttl_ms] = reply else {
            return Err(RateLimitError::ScriptReply(format!(
                "expected 3 integers, got {:?}",
                reply
            )));
        };

        let reset = ResetTime::from_ttl_ms(*ttl_ms, now);
        Ok(Self {
            limited: *limited != 0,
            count: *count,
            remaining: limit.saturating_sub(*count),
            reset,
            wait: reset.wait_from(now),
        })
    }
}
