//! End-to-end engine tests with mock backends and an in-memory store.

use axum::body::Body;
use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use http::{Request, StatusCode};
use portico_common::{ConfigStore, MemoryStore};
use portico_gateway::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn spawn_backend(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

fn name_backend() -> Router {
    async fn name(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        Json(json!({"name": params.get("name").cloned().unwrap_or_default()}))
    }
    Router::new().route("/name", get(name))
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn store_with_cluster(cluster: &str, addr: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .set(
            format!("clusters/{cluster}/i1"),
            json!({"idx": "i1", "addr": addr}).to_string(),
        )
        .await;
    store
}

#[tokio::test]
async fn test_prefix_route_strips_prefix_end_to_end() {
    let addr = spawn_backend(name_backend()).await;
    let store = store_with_cluster("c1", &addr).await;
    store
        .set(
            "routings/r1",
            json!({"prefix": "/srv", "cluster_id": "c1", "need_strip_prefix": true}).to_string(),
        )
        .await;

    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let response = engine.handle(request("GET", "/srv/name?name=x")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "x");
}

#[tokio::test]
async fn test_combined_api_returns_keyed_envelope() {
    let name_addr = spawn_backend(Router::new().route(
        "/srv/name",
        get(|| async { Json(json!({"name": "x"})) }),
    ))
    .await;
    let id_addr = spawn_backend(Router::new().route(
        "/srv/id",
        get(|| async { Json(json!({"id": 7})) }),
    ))
    .await;

    let store = store_with_cluster("c1", &name_addr).await;
    store
        .set(
            "clusters/c2/i1",
            json!({"idx": "i1", "addr": id_addr}).to_string(),
        )
        .await;
    store
        .set(
            "apis/agg",
            json!({
                "path": "/api/agg", "method": "GET", "target_cluster_id": "c1",
                "need_combine": true,
                "combine_req_cfgs": [
                    {"target_cluster_id": "c1", "method": "GET", "path": "/srv/name", "field": "n"},
                    {"target_cluster_id": "c2", "method": "GET", "path": "/srv/id", "field": "i"}
                ]
            })
            .to_string(),
        )
        .await;

    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let response = engine.handle(request("GET", "/api/agg")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["message"], "OK");
    assert_eq!(body["n"]["name"], "x");
    assert_eq!(body["i"]["id"], 7);
}

#[tokio::test]
async fn test_combined_api_with_missing_cluster_degrades_per_field() {
    let name_addr = spawn_backend(Router::new().route(
        "/srv/name",
        get(|| async { Json(json!({"name": "x"})) }),
    ))
    .await;

    let store = store_with_cluster("c1", &name_addr).await;
    store
        .set(
            "apis/agg",
            json!({
                "path": "/api/agg", "method": "GET", "target_cluster_id": "c1",
                "need_combine": true,
                "combine_req_cfgs": [
                    {"target_cluster_id": "c1", "method": "GET", "path": "/srv/name", "field": "n"},
                    {"target_cluster_id": "c2", "method": "GET", "path": "/srv/id", "field": "i"}
                ]
            })
            .to_string(),
        )
        .await;

    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let response = engine.handle(request("GET", "/api/agg")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["message"], "OK");
    assert_eq!(body["n"]["name"], "x");
    assert_eq!(body["i"], "No available cluster");
}

#[tokio::test]
async fn test_unmatched_request_is_404() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let response = engine.handle(request("GET", "/nothing/here")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Page not found");
}

#[tokio::test]
async fn test_watcher_reload_picks_up_new_rules_while_serving() {
    let addr = spawn_backend(name_backend()).await;
    let store = Arc::new(MemoryStore::new());

    let engine = Engine::new(store.clone() as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();
    engine.spawn_watchers(Duration::from_millis(30));

    // Nothing configured yet.
    let response = engine.handle(request("GET", "/srv/name?name=x")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    store
        .set(
            "clusters/c1/i1",
            json!({"idx": "i1", "addr": addr}).to_string(),
        )
        .await;
    store
        .set(
            "routings/r1",
            json!({"prefix": "/srv", "cluster_id": "c1", "need_strip_prefix": true}).to_string(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = engine.handle(request("GET", "/srv/name?name=x")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "x");

    engine.shutdown();
}

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = hits.clone();
    let app = Router::new().route(
        "/name",
        get(move || {
            let hits = hits_in_handler.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({"name": "cached"}))
            }
        }),
    );
    let addr = spawn_backend(app).await;

    let store = store_with_cluster("c1", &addr).await;
    store
        .set(
            "routings/r1",
            json!({"prefix": "/srv", "cluster_id": "c1", "need_strip_prefix": true}).to_string(),
        )
        .await;

    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let first = engine.handle(request("GET", "/srv/name")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = engine.handle(request("GET", "/srv/name")).await;
    assert_eq!(second.status(), StatusCode::OK);
    let body = body_json(second).await;
    assert_eq!(body["name"], "cached");

    assert_eq!(hits.load(Ordering::SeqCst), 1, "second hit came from cache");
}

#[tokio::test]
async fn test_rate_limiter_rejects_after_burst() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    // The default bucket admits 10 requests; the chain runs before
    // matching, so unmatched 404s still consume tokens.
    let mut statuses = Vec::new();
    for _ in 0..12 {
        let response = engine.handle(request("GET", "/missing")).await;
        statuses.push(response.status());
    }

    assert!(statuses[..10]
        .iter()
        .all(|status| *status == StatusCode::NOT_FOUND));
    assert!(statuses[10..]
        .iter()
        .all(|status| *status == StatusCode::TOO_MANY_REQUESTS));
}

#[tokio::test]
async fn test_status_endpoint_snapshot() {
    let addr = spawn_backend(name_backend()).await;
    let store = store_with_cluster("c1", &addr).await;

    let engine = Engine::new(store as Arc<dyn ConfigStore>, Vec::new())
        .await
        .unwrap();

    let status = engine.status().await;
    assert_eq!(status["clusters"][0]["idx"], "c1");
    assert_eq!(status["apis"], 0);
    let plugin_names: Vec<&str> = status["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert!(plugin_names.contains(&"plugin.httplog"));
    assert!(plugin_names.contains(&"plugin.cache"));
    assert!(plugin_names.contains(&"plugin.ratelimit"));
}
