//! The engine: plugin chain, context pool, dispatch core and reload
//! orchestration behind one handle.

use crate::watcher::Watcher;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{Request, StatusCode};
use portico_common::store::{APIS_KEY, CLUSTERS_KEY, CLUSTER_OPTIONS_KEY, ROUTINGS_KEY};
use portico_common::{
    ApiRule, ConfigStore, NocacheRule, Result, RoutingRule, ServerInstance,
};
use portico_plugin::cache::Cache;
use portico_plugin::httplog::HttpLog;
use portico_plugin::ratelimit::RateLimit;
use portico_plugin::{ContextPool, PluginRef};
use portico_proxy::Proxier;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Contexts pre-allocated at startup.
const POOL_INITIAL: usize = 64;
/// Contexts the pool will park; excess returns are dropped.
const POOL_CAPACITY: usize = 1024;
/// Largest request body the gateway buffers.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// One gateway instance: the plugin chain, the pooled contexts, the
/// dispatch core and the store it reloads from.
pub struct Engine {
    proxier: Arc<Proxier>,
    pool: ContextPool,
    plugins: Vec<PluginRef>,
    cache: Arc<Cache>,
    store: Arc<dyn ConfigStore>,
    watchers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over `store`, install the standard plugin chain
    /// (access log, cache, rate limit) plus `extra_plugins`, and perform
    /// the initial table load. Invalid startup configuration is fatal;
    /// an unreachable subtree merely leaves its table empty.
    pub async fn new(
        store: Arc<dyn ConfigStore>,
        extra_plugins: Vec<PluginRef>,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Cache::new(None));

        let mut plugins: Vec<PluginRef> = vec![
            Arc::new(HttpLog::new()),
            cache.clone(),
            Arc::new(RateLimit::default()),
        ];
        plugins.extend(extra_plugins);
        for plugin in &plugins {
            tracing::info!(plugin = plugin.name(), "plugin installed");
        }

        let engine = Arc::new(Self {
            proxier: Arc::new(Proxier::new()?),
            pool: ContextPool::new(POOL_INITIAL, POOL_CAPACITY, plugins.clone()),
            plugins,
            cache,
            store,
            watchers: Mutex::new(Vec::new()),
        });

        engine.prepare().await?;
        Ok(engine)
    }

    /// Initial load of every table.
    async fn prepare(&self) -> Result<()> {
        self.prepare_clusters().await?;
        self.prepare_apis().await?;
        self.prepare_routings().await?;
        self.prepare_cache_rules().await;
        Ok(())
    }

    /// Rebuild the cluster map (and with it the breaker registry) from
    /// the store.
    pub async fn prepare_clusters(&self) -> Result<()> {
        let entries = match self.store.list(CLUSTERS_KEY).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "cluster subtree unavailable, previous clusters remain in effect");
                return Ok(());
            }
        };

        let mut cfgs: HashMap<String, Vec<ServerInstance>> = HashMap::new();
        for entry in &entries {
            if entry.is_dir {
                continue;
            }
            let segments: Vec<&str> = entry.key.split('/').collect();
            if segments.len() < 3 {
                continue;
            }
            let (cluster_id, leaf) = (segments[1], segments[2]);
            if leaf == CLUSTER_OPTIONS_KEY {
                continue;
            }
            match serde_json::from_str::<ServerInstance>(&entry.value) {
                Ok(instance) => cfgs.entry(cluster_id.to_string()).or_default().push(instance),
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "skipping undecodable instance record");
                }
            }
        }

        self.proxier.load_clusters(cfgs).await;
        Ok(())
    }

    /// Rebuild the API table from the store.
    pub async fn prepare_apis(&self) -> Result<()> {
        let entries = match self.store.list(APIS_KEY).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "api subtree unavailable, previous rules remain in effect");
                return Ok(());
            }
        };

        let mut rules = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.is_dir {
                continue;
            }
            match serde_json::from_str::<ApiRule>(&entry.value) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "skipping undecodable api record");
                }
            }
        }

        self.proxier.load_apis(rules).await
    }

    /// Rebuild the routing table from the store.
    pub async fn prepare_routings(&self) -> Result<()> {
        let entries = match self.store.list(ROUTINGS_KEY).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "routing subtree unavailable, previous rules remain in effect");
                return Ok(());
            }
        };

        let mut rules = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.is_dir {
                continue;
            }
            match serde_json::from_str::<RoutingRule>(&entry.value) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "skipping undecodable routing record");
                }
            }
        }

        self.proxier.load_routings(rules).await
    }

    /// Reload the cache plugin's no-cache patterns. Routing records may
    /// carry a `regexp` field for this; records without one are ignored.
    pub async fn prepare_cache_rules(&self) {
        let entries = match self.store.list(ROUTINGS_KEY).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let rules: Vec<NocacheRule> = entries
            .iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| serde_json::from_str(&entry.value).ok())
            .collect();
        self.cache.load(&rules);
    }

    /// Start one watcher per table. Cluster reloads rebuild the breaker
    /// registry too, so that watcher deduplicates by content hash; the
    /// api and routing reloads are cheap and idempotent and run on every
    /// poll. Reload failures are logged; the previous snapshot keeps
    /// serving.
    pub fn spawn_watchers(self: &Arc<Self>, interval: Duration) {
        let mut handles = self.watchers.lock().unwrap_or_else(|e| e.into_inner());

        let engine = self.clone();
        handles.push(
            Watcher::hashed(self.store.clone(), CLUSTERS_KEY, interval).spawn(move |_events| {
                let engine = engine.clone();
                async move {
                    tracing::info!("reloading cluster configs");
                    if let Err(err) = engine.prepare_clusters().await {
                        tracing::error!(error = %err, "cluster reload failed");
                    }
                }
            }),
        );

        let engine = self.clone();
        handles.push(
            Watcher::unconditional(self.store.clone(), APIS_KEY, interval).spawn(
                move |_events| {
                    let engine = engine.clone();
                    async move {
                        if let Err(err) = engine.prepare_apis().await {
                            tracing::error!(error = %err, "api reload failed");
                        }
                    }
                },
            ),
        );

        let engine = self.clone();
        handles.push(
            Watcher::unconditional(self.store.clone(), ROUTINGS_KEY, interval).spawn(
                move |_events| {
                    let engine = engine.clone();
                    async move {
                        if let Err(err) = engine.prepare_routings().await {
                            tracing::error!(error = %err, "routing reload failed");
                        }
                        engine.prepare_cache_rules().await;
                    }
                },
            ),
        );
    }

    /// Serve one request: pooled context, plugin chain, dispatch,
    /// response write-out, cache fill.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "could not buffer request body");
                return (StatusCode::BAD_REQUEST, "could not read request body").into_response();
            }
        };

        let mut ctx = match self.pool.get(parts, bytes) {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::error!(error = %err, "context pool rejected request");
                return (StatusCode::INTERNAL_SERVER_ERROR, "gateway unavailable").into_response();
            }
        };
        let original_path = ctx.path().to_string();

        ctx.next();
        if !ctx.aborted() {
            self.proxier.handle(&mut ctx).await;
        }

        // A plain forward leaves the context unaborted; those responses
        // are the cacheable ones.
        let fill_cache = !ctx.aborted() && self.cache.cacheable(ctx.method(), &original_path);
        let response = ctx.take_response();
        if fill_cache {
            self.cache.store_response(&original_path, &response);
        }
        self.pool.put(ctx);

        let mut out = Response::new(Body::from(response.body));
        *out.status_mut() = response.status;
        *out.headers_mut() = response.headers;
        out
    }

    /// Snapshot of clusters, breakers and plugins for the status
    /// endpoint.
    pub async fn status(&self) -> Value {
        let tables = self.proxier.snapshot().await;

        let mut clusters: Vec<Value> = tables
            .clusters
            .values()
            .map(|cluster| {
                json!({
                    "idx": cluster.idx(),
                    "instances": cluster
                        .instances()
                        .iter()
                        .map(|ins| json!({"idx": ins.idx, "addr": ins.addr}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        clusters.sort_by_key(|c| c["idx"].as_str().unwrap_or_default().to_string());

        let breakers: Vec<Value> = tables
            .breakers
            .states()
            .iter()
            .map(|(name, state)| json!({"name": name, "state": state.as_str()}))
            .collect();

        let plugins: Vec<Value> = self
            .plugins
            .iter()
            .map(|plugin| {
                json!({
                    "name": plugin.name(),
                    "enabled": plugin.enabled(),
                    "status": format!("{:?}", plugin.status()).to_lowercase(),
                })
            })
            .collect();

        json!({
            "clusters": clusters,
            "breakers": breakers,
            "plugins": plugins,
            "apis": tables.apis.len(),
            "routings": tables.routings.len(),
        })
    }

    /// Stop the watchers and close the context pool. In-flight requests
    /// finish against their own snapshots.
    pub fn shutdown(&self) {
        let mut handles = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.pool.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut handles = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}
