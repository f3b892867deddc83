//! Polling observers of the coordination store.
//!
//! One watcher per table polls its subtree at a fixed cadence and
//! reports `(op, key, value)` events for the delta since the previous
//! poll. A hashed watcher only fires its callback when record content
//! actually changed; an unconditional watcher fires on every successful
//! poll and leaves idempotence to the reload. Each watcher owns its hash
//! cache, so several engines can coexist in one process.

use portico_common::hash::content_hash;
use portico_common::{ConfigStore, KvEntry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Poll cadence used by the gateway.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Set,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub op: OpCode,
    pub key: String,
    pub value: String,
}

/// A polling differ over one store subtree.
pub struct Watcher {
    store: Arc<dyn ConfigStore>,
    prefix: &'static str,
    interval: Duration,
    /// Whether the callback is gated on a content change.
    dedup: bool,
    snapshot: HashMap<String, String>,
}

impl Watcher {
    /// A watcher whose callback fires only when record content changed
    /// since the previous poll.
    pub fn hashed(store: Arc<dyn ConfigStore>, prefix: &'static str, interval: Duration) -> Self {
        Self {
            store,
            prefix,
            interval,
            dedup: true,
            snapshot: HashMap::new(),
        }
    }

    /// A watcher whose callback fires on every successful poll; the
    /// consumer's reload is expected to be idempotent.
    pub fn unconditional(
        store: Arc<dyn ConfigStore>,
        prefix: &'static str,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            prefix,
            interval,
            dedup: false,
            snapshot: HashMap::new(),
        }
    }

    /// Start the poll loop. A hashed watcher's first poll only primes
    /// the hash cache: the engine has already loaded the startup state,
    /// so it must not fire a reload. An unconditional watcher fires on
    /// every poll, startup state included.
    pub fn spawn<F, Fut>(mut self, mut callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Vec<WatchEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut primed = false;

            loop {
                ticker.tick().await;

                let entries = match self.store.list(self.prefix).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::warn!(
                            prefix = self.prefix,
                            error = %err,
                            "store poll failed, previous tables remain in effect"
                        );
                        continue;
                    }
                };

                let events = self.diff(&entries);
                if !events.is_empty() {
                    tracing::info!(prefix = self.prefix, changes = events.len(), "store changed");
                }
                if self.dedup {
                    if primed && !events.is_empty() {
                        callback(events).await;
                    }
                } else {
                    callback(events).await;
                }
                primed = true;
            }
        })
    }

    /// Compare a listing against the hash cache and update the cache.
    fn diff(&mut self, entries: &[KvEntry]) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        let mut next = HashMap::with_capacity(entries.len());

        for entry in entries {
            if entry.is_dir {
                continue;
            }
            let hashed = content_hash(&entry.value);
            match self.snapshot.get(&entry.key) {
                None => events.push(WatchEvent {
                    op: OpCode::Set,
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                }),
                Some(prev) if *prev != hashed => events.push(WatchEvent {
                    op: OpCode::Update,
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                }),
                Some(_) => {}
            }
            next.insert(entry.key.clone(), hashed);
        }

        for key in self.snapshot.keys() {
            if !next.contains_key(key) {
                events.push(WatchEvent {
                    op: OpCode::Delete,
                    key: key.clone(),
                    value: String::new(),
                });
            }
        }

        self.snapshot = next;
        events
    }
}
