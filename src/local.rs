//! In-process sliding-window log limiter.

use async_trait::async_trait;
use std::time::Duration;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::{LimiterKind, RateLimitRule},
    error::Result,
    limiter::RateLimiter,
    utils::{lock_or_cancel, sleep_or_cancel},
};

/// Timestamps of the most recent grants, bounded to `capacity` entries.
///
/// Backed by a fixed-size ring: `head` is the slot the next grant is
/// written to, so walking backwards from it yields grants newest first.
#[derive(Debug)]
pub struct GrantLog {
    slots: Vec<Instant>,
    capacity: usize,
    head: usize,
}

impl GrantLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Record a grant, overwriting the oldest one once full.
    pub fn push(&mut self, at: Instant) {
        if self.capacity == 0 {
            return;
        }

        if self.slots.len() < self.capacity {
            self.slots.push(at);
        } else {
            self.slots[self.head] = at;
        }
        self.head = (self.head + 1) % self.capacity;
    }

    /// Grants from most recent to oldest
    pub fn iter(&self) -> impl Iterator<Item = Instant> + '_ {
        let len = self.slots.len();
        (1..=len).map(move |step| self.slots[(self.head + len - step) % len])
    }

    /// How long the next caller must wait, if at all.
    ///
    /// Counts grants newer than `now - window`, stopping at the first one
    /// outside the window. Once `capacity` grants are inside the window,
    /// the oldest of them decides when a slot frees up.
    pub fn wait_time(&self, now: Instant, window: Duration) -> Option<Duration> {
        let target = now.checked_sub(window);
        let mut count = 0;
        let mut oldest_in_window = None;

        for granted in self.iter() {
            if matches!(target, Some(target) if granted <= target) {
                break;
            }
            count += 1;
            oldest_in_window = Some(granted);
        }

        if count < self.capacity {
            return None;
        }

        oldest_in_window.map(|oldest| (oldest + window).saturating_duration_since(now))
    }
}

/// Limiter that keeps its grant log in process memory
pub struct LocalRateLimiter {
    key: String,
    rule: RateLimitRule,
    grants: Mutex<GrantLog>,
}

impl LocalRateLimiter {
    pub fn new(rule: RateLimitRule, key: impl Into<String>) -> Self {
        let capacity = if rule.is_unlimited() {
            0
        } else {
            usize::try_from(rule.limit).unwrap_or(usize::MAX)
        };

        Self {
            key: key.into(),
            rule,
            grants: Mutex::new(GrantLog::new(capacity)),
        }
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// Number of grants currently remembered
    pub async fn recorded_grants(&self) -> usize {
        self.grants.lock().await.len()
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn invoke(&self, cancel: &CancellationToken) -> Result<()> {
        if self.rule.is_unlimited() {
            return Ok(());
        }

        let mut grants = lock_or_cancel(&self.grants, cancel).await?;

        if let Some(wait) = grants.wait_time(Instant::now(), self.rule.window) {
            debug!(
                key = %self.key,
                limit = self.rule.limit,
                wait_ms = wait.as_millis() as u64,
                "Local limit reached, waiting for the oldest grant to leave the window"
            );
            sleep_or_cancel(wait, cancel).await?;
        }

        grants.push(Instant::now());
        trace!(key = %self.key, "Local admission granted");
        Ok(())
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> LimiterKind {
        LimiterKind::Local
    }
}
