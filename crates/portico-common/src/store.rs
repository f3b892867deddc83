//! Coordination-store access.
//!
//! The gateway's rule tables live in a remote key/value hierarchy:
//!
//! - `clusters/<cluster_id>/<instance_idx>` → JSON [`ServerInstance`](crate::ServerInstance)
//! - `clusters/<cluster_id>/options`        → cluster options (skipped)
//! - `apis/<api_id>`                        → JSON [`ApiRule`](crate::ApiRule)
//! - `routings/<routing_id>`                → JSON [`RoutingRule`](crate::RoutingRule)
//!
//! [`ConfigStore`] is the minimal contract the engine and watchers need: a
//! depth-bounded listing of a subtree yielding `(key, value, is_dir)`
//! triples. [`EtcdStore`] speaks the etcd v2 HTTP API; [`MemoryStore`] is
//! an in-process implementation used by the tests.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Store subtree holding cluster definitions.
pub const CLUSTERS_KEY: &str = "clusters";
/// Store subtree holding API rules.
pub const APIS_KEY: &str = "apis";
/// Store subtree holding routing rules.
pub const ROUTINGS_KEY: &str = "routings";
/// Per-cluster options record, skipped by the instance iterator.
pub const CLUSTER_OPTIONS_KEY: &str = "options";

/// Traversal depth bound for subtree listings.
const MAX_TREE_DEPTH: usize = 4;

/// One entry of a subtree listing. Keys are normalized without a leading
/// slash, e.g. `clusters/c1/i1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// List the subtree under `prefix`, directories included.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;
}

// ---------------------------------------------------------------------------
// etcd v2 HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    #[serde(default)]
    dir: bool,
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

/// Store client speaking the etcd v2 `/v2/keys` JSON API over HTTP.
///
/// Multiple endpoints are tried in order; the first one that answers
/// wins. All previous tables remain in effect when no endpoint answers,
/// so a flaky store degrades to stale-but-serving.
pub struct EtcdStore {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

impl EtcdStore {
    /// Connect to the store, verifying that at least one endpoint answers.
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let store = Self { endpoints, client };

        let endpoints = store.endpoints.clone();
        for endpoint in &endpoints {
            let url = format!("{}/version", endpoint.trim_end_matches('/'));
            match store.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(endpoint = %endpoint, "connected to coordination store");
                    return Ok(store);
                }
                Ok(resp) => {
                    tracing::warn!(endpoint = %endpoint, status = %resp.status(), "store endpoint rejected version probe");
                }
                Err(err) => {
                    tracing::warn!(endpoint = %endpoint, error = %err, "store endpoint unreachable");
                }
            }
        }

        Err(GatewayError::StoreUnavailable(
            "no reachable etcd endpoint".to_string(),
        ))
    }

    fn flatten(node: &EtcdNode, depth: usize, out: &mut Vec<KvEntry>) {
        if depth > MAX_TREE_DEPTH {
            return;
        }
        if let Some(key) = &node.key {
            out.push(KvEntry {
                key: key.trim_start_matches('/').to_string(),
                value: node.value.clone().unwrap_or_default(),
                is_dir: node.dir,
            });
        }
        for child in &node.nodes {
            Self::flatten(child, depth + 1, out);
        }
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut last_err = GatewayError::StoreUnavailable("no endpoints configured".to_string());

        for endpoint in &self.endpoints {
            let url = format!(
                "{}/v2/keys/{}?recursive=true",
                endpoint.trim_end_matches('/'),
                prefix.trim_matches('/')
            );
            let resp = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    last_err = GatewayError::StoreUnavailable(err.to_string());
                    continue;
                }
            };

            // A missing subtree is an empty listing, not an error.
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !resp.status().is_success() {
                last_err =
                    GatewayError::StoreUnavailable(format!("status {} from {}", resp.status(), url));
                continue;
            }

            let tree: EtcdResponse = resp
                .json()
                .await
                .map_err(|err| GatewayError::StoreUnavailable(err.to_string()))?;
            let mut entries = Vec::new();
            // The root node is the prefix directory itself; only its
            // children are interesting.
            for child in &tree.node.nodes {
                Self::flatten(child, 1, &mut entries);
            }
            return Ok(entries);
        }

        Err(last_err)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process [`ConfigStore`] used by tests and local experiments.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .write()
            .await
            .insert(key.into(), value.into());
    }

    pub async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let entries = self.entries.read().await;
        let prefix = prefix.trim_matches('/');
        Ok(entries
            .iter()
            .filter(|(key, _)| {
                key.as_str() == prefix || key.starts_with(&format!("{prefix}/"))
            })
            .map(|(key, value)| KvEntry {
                key: key.clone(),
                value: value.clone(),
                is_dir: false,
            })
            .collect())
    }
}
