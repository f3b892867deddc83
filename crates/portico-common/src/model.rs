//! Configuration records as they are stored in the coordination store.
//!
//! Every record is a JSON document under one of the store subtrees
//! (`clusters/`, `apis/`, `routings/`). The structs here mirror those
//! documents; normalization (lowercasing, prefix checks) happens when the
//! rule tables are loaded, not here.

use serde::{Deserialize, Serialize};

/// Response code for successful requests and combination envelopes.
pub const CODE_OK: i64 = 0;
/// Response code attached to JSON error bodies.
pub const CODE_SYSTEM_ERR: i64 = 500;

/// One backend endpoint inside a cluster.
///
/// Instances are replaced wholesale on reload and never mutated in place;
/// instances with `is_alive == false` are invisible to the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Stable identifier, unique within the cluster.
    pub idx: String,
    /// Absolute address including scheme, e.g. `http://10.0.0.3:9091`.
    pub addr: String,
    #[serde(default = "default_true")]
    pub is_alive: bool,
    /// Whether calls to this instance go through a circuit breaker.
    #[serde(default)]
    pub open_breaker: bool,
    /// Per-instance breaker thresholds; defaults apply when absent.
    #[serde(default)]
    pub breaker_setting: Option<BreakerSetting>,
    /// Free-form operator tags, carried but not interpreted.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Circuit breaker thresholds. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSetting {
    /// Interval after which the per-interval counters reset. `0` disables
    /// the reset.
    #[serde(default)]
    pub clear_interval_ms: u64,
    /// Concurrent probes admitted while half-open.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// How long an open breaker waits before admitting a probe.
    #[serde(default = "default_breaker_timeout")]
    pub timeout_ms: u64,
    /// Minimum request count before the failure ratio is considered.
    #[serde(default = "default_trip_request_cnt")]
    pub trip_request_cnt: u32,
    /// Failure ratio at which the breaker trips.
    #[serde(default = "default_trip_failure_ratio")]
    pub trip_failure_ratio: f64,
}

fn default_max_requests() -> u32 {
    1
}

fn default_breaker_timeout() -> u64 {
    60_000
}

fn default_trip_request_cnt() -> u32 {
    10
}

fn default_trip_failure_ratio() -> f64 {
    0.6
}

impl Default for BreakerSetting {
    fn default() -> Self {
        Self {
            clear_interval_ms: 0,
            max_requests: default_max_requests(),
            timeout_ms: default_breaker_timeout(),
            trip_request_cnt: default_trip_request_cnt(),
            trip_failure_ratio: default_trip_failure_ratio(),
        }
    }
}

/// Exact-match API rule: `(method, path)` maps to one cluster, optionally
/// fanning out to several downstreams whose bodies are combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRule {
    /// Request path, compared lowercased and exact.
    pub path: String,
    /// Comma-separated list of allowed HTTP verbs, e.g. `"GET,POST"`.
    pub method: String,
    pub target_cluster_id: String,
    /// When non-empty, replaces the URL path before forwarding.
    #[serde(default)]
    pub rewrite_path: String,
    #[serde(default)]
    pub need_combine: bool,
    #[serde(default)]
    pub combine_req_cfgs: Vec<ApiCombination>,
}

impl ApiRule {
    /// Whether `method` appears in this rule's verb list.
    pub fn allows_method(&self, method: &str) -> bool {
        self.method
            .split(',')
            .any(|m| m.trim().eq_ignore_ascii_case(method))
    }
}

/// One downstream of a combining API rule. `field` is the key under which
/// the downstream's JSON body lands in the merged envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCombination {
    pub target_cluster_id: String,
    pub method: String,
    pub path: String,
    pub field: String,
}

/// Prefix routing rule: the leading path segment maps to a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Leading path segment including the `/`, e.g. `/srv`.
    pub prefix: String,
    pub cluster_id: String,
    #[serde(default)]
    pub need_strip_prefix: bool,
}

/// A no-cache pattern for the cache plugin: URIs matching the compiled
/// regular expression are never cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NocacheRule {
    #[serde(default)]
    pub regexp: String,
}

/// A user known to the RBAC plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModel {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A URI that requires one of the listed roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitUrlRule {
    pub uri: String,
    pub roles: Vec<String>,
}

/// The `{code, message}` envelope used for error bodies and as the head of
/// combination responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeInfo {
    pub code: i64,
    pub message: String,
}

impl CodeInfo {
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            message: "OK".to_string(),
        }
    }

    pub fn system_err(message: impl Into<String>) -> Self {
        Self {
            code: CODE_SYSTEM_ERR,
            message: message.into(),
        }
    }
}
