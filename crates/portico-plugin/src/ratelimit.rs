//! Token-bucket rate limiting plugin.

use crate::{Context, Plugin, PluginStatus};
use http::StatusCode;
use portico_common::CodeInfo;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Optional JSON config accepted by the plugin registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size).
    pub capacity: f64,
    /// Tokens refilled per second.
    pub fill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            fill_rate: 1.0,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn try_consume(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.fill_rate).min(config.capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Gateway-wide token bucket. Requests that find the bucket empty are
/// answered with 429 and never reach the dispatcher.
#[derive(Debug)]
pub struct RateLimit {
    enabled: AtomicBool,
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl RateLimit {
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = TokenBucket {
            tokens: config.capacity,
            last_update: Instant::now(),
        };
        Self {
            enabled: AtomicBool::new(true),
            config,
            bucket: Mutex::new(bucket),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl Plugin for RateLimit {
    fn handle(&self, ctx: &mut Context) {
        let allowed = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.try_consume(&self.config, Instant::now())
        };
        if !allowed {
            tracing::warn!(path = %ctx.path(), "request rate limited");
            ctx.json(
                StatusCode::TOO_MANY_REQUESTS,
                &CodeInfo::system_err("too many requests"),
            );
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn status(&self) -> PluginStatus {
        if self.enabled() {
            PluginStatus::Working
        } else {
            PluginStatus::Stopped
        }
    }

    fn name(&self) -> &str {
        "plugin.ratelimit"
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
