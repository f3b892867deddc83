//! Response cache plugin.
//!
//! GET responses are cached in memory keyed by URI, except for URIs
//! matching one of the configured no-cache patterns. Cache fills happen
//! outside the chain, once the dispatcher has produced a response; the
//! plugin itself only serves hits and decides cacheability.

use crate::context::ResponseParts;
use crate::{Context, Plugin, PluginStatus};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use portico_common::NocacheRule;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct Cache {
    enabled: AtomicBool,
    reloading: AtomicBool,
    rules: RwLock<Vec<Regex>>,
    store: RwLock<HashMap<String, CachedResponse>>,
    ttl: Duration,
}

impl Cache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            reloading: AtomicBool::new(false),
            rules: RwLock::new(Vec::new()),
            store: RwLock::new(HashMap::new()),
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        }
    }

    /// Replace the no-cache rule set. Patterns that fail to compile are
    /// logged and skipped; rules with an empty pattern are ignored.
    pub fn load(&self, rules: &[NocacheRule]) {
        self.reloading.store(true, Ordering::SeqCst);
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.regexp.is_empty() {
                continue;
            }
            match Regex::new(&rule.regexp) {
                Ok(re) => compiled.push(re),
                Err(err) => {
                    tracing::warn!(pattern = %rule.regexp, error = %err, "skipping invalid nocache pattern");
                }
            }
        }
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = compiled;
        self.reloading.store(false, Ordering::SeqCst);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether `uri` matches any compiled no-cache pattern.
    pub fn match_no_cache_rule(&self, uri: &str) -> bool {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|re| re.is_match(uri))
    }

    /// Whether a response for this request may be stored.
    pub fn cacheable(&self, method: &Method, uri: &str) -> bool {
        *method == Method::GET && !self.match_no_cache_rule(uri)
    }

    /// Store a dispatched response for later hits. Only 200 responses
    /// are kept.
    pub fn store_response(&self, uri: &str, resp: &ResponseParts) {
        if resp.status != StatusCode::OK {
            return;
        }
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.insert(
            uri.to_string(),
            CachedResponse {
                status: resp.status,
                headers: resp.headers.clone(),
                body: resp.body.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    fn lookup(&self, uri: &str) -> Option<(StatusCode, HeaderMap, Bytes)> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let hit = store.get(uri)?;
        if hit.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some((hit.status, hit.headers.clone(), hit.body.clone()))
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.store.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Plugin for Cache {
    fn handle(&self, ctx: &mut Context) {
        if !self.cacheable(ctx.method(), ctx.path()) {
            return;
        }
        if let Some((status, headers, body)) = self.lookup(ctx.path()) {
            tracing::debug!(path = %ctx.path(), "served from cache");
            ctx.write_response(status, headers, body);
            ctx.abort_with_status(status);
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn status(&self) -> PluginStatus {
        if self.reloading.load(Ordering::SeqCst) {
            PluginStatus::Reloading
        } else if self.enabled() {
            PluginStatus::Working
        } else {
            PluginStatus::Stopped
        }
    }

    fn name(&self) -> &str {
        "plugin.cache"
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
