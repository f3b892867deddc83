//! Per-instance circuit breakers and the registry that owns them.
//!
//! A breaker wraps every call to its instance. While closed it only
//! counts outcomes; once the failure ratio trips it opens and refuses
//! calls outright, and after a cool-down it admits a bounded number of
//! probes to decide whether the instance has recovered.

use crate::cluster::Cluster;
use portico_common::{BreakerSetting, GatewayError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Request/outcome counters. The interval reset clears the per-interval
/// counters but leaves the consecutive ones untouched.
#[derive(Debug, Clone, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear_interval(&mut self) {
        self.requests = 0;
        self.total_successes = 0;
        self.total_failures = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

struct Inner {
    state: BreakerState,
    counts: Counts,
    /// Bumped on every state change; outcomes reported against a stale
    /// generation are discarded.
    generation: u64,
    opened_at: Option<Instant>,
    interval_start: Instant,
}

/// One circuit breaker, keyed `<cluster>_<instance>` in the registry.
pub struct CircuitBreaker {
    name: String,
    setting: BreakerSetting,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, setting: BreakerSetting) -> Self {
        Self {
            name: name.into(),
            setting,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                generation: 0,
                opened_at: None,
                interval_start: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` under the breaker. Refused immediately with
    /// [`GatewayError::OpenCircuit`] while open, and with
    /// [`GatewayError::TooManyProbes`] when the half-open probe budget is
    /// exhausted. The outcome of `f` feeds the counters.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.before()?;
        let result = f().await;
        self.after(generation, result.is_ok());
        result
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.tick(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counts.clone()
    }

    /// Time-driven transitions: Open breakers cool down into HalfOpen,
    /// and closed breakers reset their interval counters every
    /// `clear_interval_ms`.
    fn tick(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if self.setting.clear_interval_ms > 0 {
                    let interval = Duration::from_millis(self.setting.clear_interval_ms);
                    if now.duration_since(inner.interval_start) >= interval {
                        inner.counts.clear_interval();
                        inner.interval_start = now;
                    }
                }
            }
            BreakerState::Open => {
                let timeout = Duration::from_millis(self.setting.timeout_ms);
                if let Some(opened_at) = inner.opened_at {
                    if now.duration_since(opened_at) >= timeout {
                        self.transition(inner, BreakerState::HalfOpen, now);
                    }
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        tracing::info!(
            breaker = %self.name,
            from = inner.state.as_str(),
            to = state.as_str(),
            "circuit breaker state change"
        );
        inner.state = state;
        inner.generation += 1;
        inner.counts.clear();
        inner.interval_start = now;
        inner.opened_at = match state {
            BreakerState::Open => Some(now),
            _ => None,
        };
    }

    fn before(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.tick(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Open => Err(GatewayError::OpenCircuit),
            BreakerState::HalfOpen if inner.counts.requests >= self.setting.max_requests => {
                Err(GatewayError::TooManyProbes)
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        }
    }

    fn after(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.tick(&mut inner, now);
        if inner.generation != generation {
            // The breaker changed state while this call was in flight.
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.setting.max_requests
            {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                BreakerState::Closed if self.ready_to_trip(&inner.counts) => {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                BreakerState::HalfOpen => {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                _ => {}
            }
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.requests < self.setting.trip_request_cnt {
            return false;
        }
        let ratio = counts.total_failures as f64 / counts.requests as f64;
        ratio >= self.setting.trip_failure_ratio
    }
}

/// One breaker per `(cluster, instance)` pair that opted in via
/// `open_breaker`. The registry is rebuilt together with the cluster map;
/// instances without a breaker are forwarded to directly.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

fn breaker_key(cluster_idx: &str, instance_idx: &str) -> String {
    format!("{cluster_idx}_{instance_idx}")
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for a freshly loaded cluster map.
    pub fn build(clusters: &HashMap<String, Arc<Cluster>>) -> Self {
        let mut breakers = HashMap::new();
        for cluster in clusters.values() {
            for instance in cluster.instances() {
                if !instance.open_breaker {
                    continue;
                }
                let key = breaker_key(cluster.idx(), &instance.idx);
                let setting = instance.breaker_setting.clone().unwrap_or_default();
                breakers.insert(
                    key.clone(),
                    Arc::new(CircuitBreaker::new(key, setting)),
                );
            }
        }
        Self { breakers }
    }

    pub fn get(&self, cluster_idx: &str, instance_idx: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&breaker_key(cluster_idx, instance_idx))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Breaker names and states, sorted by name, for the status endpoint.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<(String, BreakerState)> = self
            .breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
