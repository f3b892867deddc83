//! Request dispatch: match, select, gate, forward.

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::cluster::Cluster;
use crate::combination::{combine_one, COMBINE_TIMEOUT};
use crate::tables::{ApiTable, RoutingTable};
use futures::FutureExt;
use http::{header::HeaderName, StatusCode};
use portico_common::{ApiRule, GatewayError, Result, RoutingRule, ServerInstance, CODE_OK};
use portico_plugin::Context;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Request headers owned by the connection; never copied to the
/// upstream request.
const SKIPPED_REQUEST_HEADERS: [HeaderName; 5] = [
    http::header::HOST,
    http::header::CONTENT_LENGTH,
    http::header::CONNECTION,
    http::header::TRANSFER_ENCODING,
    http::header::UPGRADE,
];

/// One consistent snapshot of the rule tables.
///
/// Dispatch clones the outer `Arc` and works against an immutable view;
/// reloads build a fresh snapshot off-lock and swap the pointer, so a
/// reader sees either the old tables or the new ones, never a mix of a
/// single table.
#[derive(Clone)]
pub struct RouteTables {
    pub clusters: Arc<HashMap<String, Arc<Cluster>>>,
    pub breakers: Arc<BreakerRegistry>,
    pub apis: Arc<ApiTable>,
    pub routings: Arc<RoutingTable>,
}

impl RouteTables {
    fn empty() -> Self {
        Self {
            clusters: Arc::new(HashMap::new()),
            breakers: Arc::new(BreakerRegistry::new()),
            apis: Arc::new(ApiTable::default()),
            routings: Arc::new(RoutingTable::default()),
        }
    }
}

/// The dispatch core. Owns the rule-table snapshot and the shared
/// upstream HTTP client.
pub struct Proxier {
    tables: RwLock<Arc<RouteTables>>,
    client: reqwest::Client,
}

impl Proxier {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            tables: RwLock::new(Arc::new(RouteTables::empty())),
            client,
        })
    }

    /// The current table snapshot.
    pub async fn snapshot(&self) -> Arc<RouteTables> {
        self.tables.read().await.clone()
    }

    /// Rebuild the cluster map and the breaker registry together and
    /// swap them in. Empty or unusable clusters are dropped; requests
    /// routed at them fail with `NoAvailableCluster`.
    pub async fn load_clusters(&self, cfgs: HashMap<String, Vec<ServerInstance>>) {
        let mut clusters = HashMap::with_capacity(cfgs.len());
        for (cluster_id, instances) in cfgs {
            let cluster_id = cluster_id.to_lowercase();
            if instances.is_empty() {
                continue;
            }
            match Cluster::new(cluster_id.clone(), instances) {
                Ok(cluster) => {
                    tracing::info!(cluster = %cluster_id, instances = cluster.len(), "cluster registered");
                    clusters.insert(cluster_id, Arc::new(cluster));
                }
                Err(err) => {
                    tracing::warn!(cluster = %cluster_id, error = %err, "cluster skipped");
                }
            }
        }

        let breakers = Arc::new(BreakerRegistry::build(&clusters));
        let clusters = Arc::new(clusters);

        let mut guard = self.tables.write().await;
        *guard = Arc::new(RouteTables {
            clusters,
            breakers,
            apis: guard.apis.clone(),
            routings: guard.routings.clone(),
        });
    }

    /// Replace the API table. Fails without touching the live tables
    /// when the rule set is invalid.
    pub async fn load_apis(&self, rules: Vec<ApiRule>) -> Result<()> {
        let apis = Arc::new(ApiTable::load(rules)?);
        let mut guard = self.tables.write().await;
        *guard = Arc::new(RouteTables {
            apis,
            clusters: guard.clusters.clone(),
            breakers: guard.breakers.clone(),
            routings: guard.routings.clone(),
        });
        Ok(())
    }

    /// Replace the routing table, same contract as [`Self::load_apis`].
    pub async fn load_routings(&self, rules: Vec<RoutingRule>) -> Result<()> {
        let routings = Arc::new(RoutingTable::load(rules)?);
        let mut guard = self.tables.write().await;
        *guard = Arc::new(RouteTables {
            routings,
            clusters: guard.clusters.clone(),
            breakers: guard.breakers.clone(),
            apis: guard.apis.clone(),
        });
        Ok(())
    }

    /// Dispatch one request. API rules take precedence over routing
    /// rules; with no match the request is answered 404. Panics inside
    /// dispatch are connection-scoped: logged and swallowed.
    pub async fn handle(&self, ctx: &mut Context) {
        let tables = self.snapshot().await;
        if let Err(panic) = AssertUnwindSafe(self.dispatch(&tables, ctx))
            .catch_unwind()
            .await
        {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(error = %msg, "panic recovered in dispatch");
        }
    }

    async fn dispatch(&self, tables: &RouteTables, ctx: &mut Context) {
        if let Some(rule) = tables.apis.match_api(ctx.method().as_str(), ctx.path()) {
            tracing::debug!(path = %ctx.path(), "matched API rule");
            let result = if rule.need_combine {
                self.call_combine(tables, &rule, ctx).await
            } else {
                self.call_reverse_api(tables, &rule, ctx).await
            };
            if let Err(err) = result {
                tracing::error!(path = %ctx.path(), error = %err, "API dispatch failed");
                ctx.set_error(err);
                ctx.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            return;
        }

        if let Some(rule) = tables.routings.match_routing(ctx.path()) {
            tracing::debug!(path = %ctx.path(), prefix = %rule.prefix, "matched routing rule");
            if let Err(err) = self.call_reverse_server(tables, &rule, ctx).await {
                tracing::error!(path = %ctx.path(), error = %err, "routing dispatch failed");
                ctx.set_error(err);
                ctx.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            return;
        }

        tracing::info!(method = %ctx.method(), path = %ctx.path(), "no API or routing rule matched");
        ctx.set_error(GatewayError::PageNotFound);
        ctx.abort_with_status(StatusCode::NOT_FOUND);
    }

    /// Single-backend forward for an API rule.
    async fn call_reverse_api(
        &self,
        tables: &RouteTables,
        rule: &ApiRule,
        ctx: &mut Context,
    ) -> Result<()> {
        if !rule.rewrite_path.is_empty() {
            ctx.set_path(rule.rewrite_path.clone());
        }

        let cluster = tables
            .clusters
            .get(&rule.target_cluster_id.to_lowercase())
            .ok_or(GatewayError::NoAvailableCluster)?;
        let instance = cluster.distribute();
        let breaker = tables.breakers.get(cluster.idx(), &instance.idx);
        self.forward(ctx, &instance, breaker).await
    }

    /// Prefix-routing forward, optionally stripping the matched prefix.
    async fn call_reverse_server(
        &self,
        tables: &RouteTables,
        rule: &RoutingRule,
        ctx: &mut Context,
    ) -> Result<()> {
        if rule.need_strip_prefix {
            let stripped = strip_prefix_ci(ctx.path(), &rule.prefix);
            ctx.set_path(stripped);
        }

        let cluster = tables
            .clusters
            .get(&rule.cluster_id.to_lowercase())
            .ok_or(GatewayError::NoAvailableCluster)?;
        let instance = cluster.distribute();
        let breaker = tables.breakers.get(cluster.idx(), &instance.idx);
        self.forward(ctx, &instance, breaker).await
    }

    async fn forward(
        &self,
        ctx: &mut Context,
        instance: &ServerInstance,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Result<()> {
        let url = upstream_url(&instance.addr, ctx.path(), ctx.query());
        tracing::debug!(url = %url, instance = %instance.idx, "forwarding to upstream");
        match breaker {
            Some(breaker) => breaker.execute(|| self.send_upstream(ctx, &url)).await,
            None => self.send_upstream(ctx, &url).await,
        }
    }

    /// Replay the buffered request against `url` and buffer the response
    /// into the context.
    async fn send_upstream(&self, ctx: &mut Context, url: &str) -> Result<()> {
        let mut request = self.client.request(ctx.method().clone(), url);
        if let Some(head) = ctx.request_head() {
            for (name, value) in head.headers.iter() {
                if SKIPPED_REQUEST_HEADERS.contains(name) {
                    continue;
                }
                request = request.header(name, value);
            }
        }
        if !ctx.body().is_empty() {
            request = request.body(ctx.body().clone());
        }

        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Downstream(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Downstream(err.to_string()))?;

        ctx.write_upstream(status, headers, body);
        Ok(())
    }

    /// Fan out to every combine config in parallel and merge the bodies
    /// into one keyed envelope. Worker failures (missing cluster, open
    /// breaker, network error, timeout, panic) are reported in-band under
    /// their field; the envelope itself always answers 200.
    async fn call_combine(
        &self,
        tables: &RouteTables,
        rule: &ApiRule,
        ctx: &mut Context,
    ) -> Result<()> {
        let mut failed: Vec<(String, GatewayError)> = Vec::new();
        let mut workers = Vec::with_capacity(rule.combine_req_cfgs.len());

        for cfg in &rule.combine_req_cfgs {
            let field = cfg.field.clone();
            let Some(cluster) = tables.clusters.get(&cfg.target_cluster_id.to_lowercase()) else {
                failed.push((field, GatewayError::NoAvailableCluster));
                continue;
            };

            let instance = cluster.distribute();
            let breaker = tables.breakers.get(cluster.idx(), &instance.idx);
            let client = self.client.clone();
            let addr = instance.addr.clone();
            let cfg = cfg.clone();

            workers.push((
                field,
                tokio::spawn(async move {
                    tokio::time::timeout(COMBINE_TIMEOUT, async move {
                        match breaker {
                            Some(breaker) => {
                                breaker.execute(|| combine_one(client, addr, cfg)).await
                            }
                            None => combine_one(client, addr, cfg).await,
                        }
                    })
                    .await
                    .unwrap_or(Err(GatewayError::CombineTimeout))
                }),
            ));
        }

        let mut envelope = Map::new();
        envelope.insert("code".to_string(), Value::from(CODE_OK));
        envelope.insert("message".to_string(), Value::from("OK"));
        for (field, err) in failed {
            envelope.insert(field, Value::from(err.to_string()));
        }
        for (field, worker) in workers {
            let value = match worker.await {
                Ok(Ok(Some(body))) => Value::Object(body),
                Ok(Ok(None)) => Value::Null,
                Ok(Err(err)) => Value::from(err.to_string()),
                Err(join_err) => {
                    tracing::error!(field = %field, error = %join_err, "combine worker panicked");
                    Value::from(format!("combine worker failed: {join_err}"))
                }
            };
            envelope.insert(field, value);
        }

        ctx.json(StatusCode::OK, &Value::Object(envelope));
        Ok(())
    }
}

fn upstream_url(addr: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", addr.trim_end_matches('/'), path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Drop `prefix` from the front of `path`, ignoring case. The prefix is
/// already normalized lowercase by the routing table.
fn strip_prefix_ci(path: &str, prefix: &str) -> String {
    if path.len() >= prefix.len() && path[..prefix.len()].eq_ignore_ascii_case(prefix) {
        path[prefix.len()..].to_string()
    } else {
        path.to_string()
    }
}
