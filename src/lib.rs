//! Keyed admission control.
//!
//! Work is gated per key so that no more than `limit` operations run within
//! a `window`. Limiters are either in-process (sliding-window log) or
//! shared across processes through Redis (fixed window evaluated by an
//! atomic Lua script). The [`Dispatcher`] is the usual entry point.

pub mod config;
pub mod dispatcher;
pub mod distributed;
pub mod error;
pub mod limiter;
pub mod local;
pub mod redis;
pub mod registry;
pub mod script;
pub mod utils;

// Re-export main types
pub use config::{LimiterKind, RateLimitRule, RateLimiterSettings};
pub use dispatcher::{Dispatcher, Target};
pub use error::{RateLimitError, Result};
pub use limiter::RateLimiter;
pub use registry::{LimiterFactory, RateLimiterRegistry, DEFAULT_KEY};
pub use tokio_util::sync::CancellationToken;
