//! In-memory stand-in for Redis that runs the fixed-window script's logic
//! atomically against tokio's clock.

#![allow(dead_code)]

use async_trait::async_trait;
use ratelimit_gate::{redis::ScriptStore, RateLimitError, Result};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;

/// SHA1 of `src/lua/fixed_window.lua` that `MemoryStore::fixed_window`
/// was last checked against. Re-read the script and update the mirror
/// before bumping this.
pub const MIRRORED_SCRIPT_SHA1: &str = "871d98087706d16cd51c4fdb2a905d089351da55";

struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn pttl(&self, now: Instant) -> i64 {
        match self.expires_at {
            Some(at) => at.saturating_duration_since(now).as_millis() as i64,
            None => -1,
        }
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    scripts: Vec<HashSet<String>>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    forget_scripts: AtomicBool,
    pub evals: AtomicUsize,
    pub loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_endpoints(1)
    }

    pub fn with_endpoints(endpoints: usize) -> Self {
        Self {
            state: Mutex::new(State {
                values: HashMap::new(),
                scripts: vec![HashSet::new(); endpoints],
            }),
            forget_scripts: AtomicBool::new(false),
            evals: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Drop every cached script, as a Redis restart would.
    pub fn flush_scripts(&self) {
        let mut state = self.state.lock().unwrap();
        for scripts in state.scripts.iter_mut() {
            scripts.clear();
        }
    }

    /// Lose scripts before every evaluation.
    pub fn set_forget_scripts(&self, forget: bool) {
        self.forget_scripts.store(forget, Ordering::SeqCst);
    }

    pub fn has_script(&self, endpoint: usize, digest: &str) -> bool {
        self.state.lock().unwrap().scripts[endpoint].contains(digest)
    }

    /// Live counter value for `key`
    pub fn counter(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        state
            .values
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .map(|e| e.value)
    }

    pub fn eval_count(&self) -> usize {
        self.evals.load(Ordering::SeqCst)
    }

    /// Rust rendition of `src/lua/fixed_window.lua`, pinned by
    /// [`MIRRORED_SCRIPT_SHA1`].
    fn fixed_window(state: &mut State, key: &str, args: &[i64]) -> Vec<i64> {
        let now = Instant::now();
        state
            .values
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));

        let (amount, window_ms, limit, lock_seconds) = (args[0], args[1], args[2], args[3]);
        let lock_key = format!("{{{}}}-lock", key);

        if let Some(lock) = state.values.get(&lock_key) {
            if lock.value == 1 {
                return vec![1, -1, lock.pttl(now)];
            }
        }

        let mut limited = false;
        let (current, mut ttl) = match state.values.get_mut(key) {
            Some(entry) => {
                let ttl = entry.pttl(now);
                if limit >= 0 && entry.value >= limit {
                    limited = true;
                } else {
                    entry.value += amount;
                }
                (entry.value, ttl)
            }
            None => {
                state.values.insert(
                    key.to_string(),
                    Entry {
                        value: amount,
                        expires_at: Some(now + Duration::from_millis(window_ms as u64)),
                    },
                );
                (amount, window_ms)
            }
        };

        if limited && lock_seconds > 0 {
            state.values.entry(lock_key).or_insert(Entry {
                value: 1,
                expires_at: Some(now + Duration::from_secs(lock_seconds as u64)),
            });
            ttl = lock_seconds * 1000;
        }

        vec![limited as i64, current, ttl]
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    fn endpoint_count(&self) -> usize {
        self.state.lock().unwrap().scripts.len()
    }

    async fn script_exists(&self, endpoint: usize, digest: &str) -> Result<bool> {
        Ok(self.has_script(endpoint, digest))
    }

    async fn script_load(&self, endpoint: usize, source: &str) -> Result<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let digest = redis::Script::new(source).get_hash().to_string();
        self.state.lock().unwrap().scripts[endpoint].insert(digest.clone());
        Ok(digest)
    }

    async fn eval_script(&self, digest: &str, keys: &[&str], args: &[i64]) -> Result<Vec<i64>> {
        self.evals.fetch_add(1, Ordering::SeqCst);
        if self.forget_scripts.load(Ordering::SeqCst) {
            self.flush_scripts();
        }

        let mut state = self.state.lock().unwrap();
        if !state.scripts[0].contains(digest) {
            return Err(RateLimitError::Redis(redis::RedisError::from((
                redis::ErrorKind::NoScriptError,
                "NOSCRIPT",
                "No matching script. Please use EVAL.".to_string(),
            ))));
        }

        Ok(Self::fixed_window(&mut state, keys[0], args))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
