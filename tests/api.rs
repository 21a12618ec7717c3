// tests/api.rs
//
// HTTP-level tests for the public Router via tower::ServiceExt::oneshot,
// against a scripted provider transport.
//
// Covered:
// - GET /health
// - GET /feed  (X-Cache MISS then HIT, paging, stale fallback, 503)
// - POST /admin/refresh  (ok and exhausted)
// - POST /admin/cache/clear  (all, one, invalid body)
// - GET /admin/quota
// - GET /metrics

mod common;

use axum::body::{self, Body};
use axum::Router;
use http::{Request, StatusCode};
use serde_json::{json, Value as Json};
use tower::ServiceExt as _;

use common::{config, harness, newsapi_body, provider, url_for, FakeTransport, Harness};
use newsdesk::metrics::Metrics;

const BODY_LIMIT: usize = 1024 * 1024;

fn app(h: &Harness) -> Router {
    let metrics = Metrics::init(&h.core.cfg).expect("metrics recorder");
    newsdesk::router(h.core.clone(), &metrics)
}

fn two_providers(t: FakeTransport) -> Harness {
    harness(config(vec![provider("a", 1, 50), provider("b", 2, 50)]), t)
}

fn healthy() -> FakeTransport {
    let t = FakeTransport::new();
    t.ok(
        &url_for("a"),
        newsapi_body("a", &[("Budget tabled in parliament", 0), ("Monsoon arrives early", 20)]),
    );
    t.ok(&url_for("b"), newsapi_body("b", &[("Chip plant opens", 40)]));
    t
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let x_cache = resp
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, x_cache, v)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET")
}

fn post(uri: &str, body: Option<Json>) -> Request<Body> {
    let builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    match body {
        Some(v) => builder.body(Body::from(v.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build POST")
}

#[tokio::test]
async fn health_returns_ok() {
    let h = two_providers(healthy());
    let resp = app(&h).oneshot(get("/health")).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().trim(), "OK");
}

#[tokio::test]
async fn feed_misses_then_hits() {
    let h = two_providers(healthy());
    let app = app(&h);

    let (status, x_cache, v) = send(&app, get("/feed?category=general")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache.as_deref(), Some("MISS"));
    assert_eq!(v["total"], 3);
    assert_eq!(v["stale"], false);
    assert_eq!(v["outcome"], "filled");
    // Newest first.
    assert_eq!(v["articles"][0]["title"], "Chip plant opens");

    let (status, x_cache, v) = send(&app, get("/feed?category=GENERAL")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache.as_deref(), Some("HIT"), "category is normalized into the key");
    assert_eq!(v["total"], 3);
    assert_eq!(h.transport.total_calls(), 2);
}

#[tokio::test]
async fn feed_pages_through_results() {
    let h = two_providers(healthy());
    let app = app(&h);

    let (_, _, v) = send(&app, get("/feed?page=2&page_size=2")).await;
    assert_eq!(v["page"], 2);
    assert_eq!(v["page_size"], 2);
    assert_eq!(v["total"], 3);
    let articles = v["articles"].as_array().expect("articles array");
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0]["title"], "Budget tabled in parliament");
}

#[tokio::test]
async fn feed_falls_back_to_stored_articles_when_providers_fail() {
    let h = two_providers(healthy());
    let app = app(&h);

    let (status, _, _) = send(&app, get("/feed")).await;
    assert_eq!(status, StatusCode::OK);

    // Providers start rejecting us and the cached entry is dropped.
    h.transport.status(&url_for("a"), 401);
    h.transport.status(&url_for("b"), 401);
    let (status, _, _) = send(&app, post("/admin/cache/clear", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, x_cache, v) = send(&app, get("/feed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache.as_deref(), Some("MISS"));
    assert_eq!(v["stale"], true);
    assert_eq!(v["total"], 3);
}

#[tokio::test]
async fn feed_is_unavailable_when_nothing_can_be_served() {
    let t = FakeTransport::new();
    t.status(&url_for("a"), 401);
    t.status(&url_for("b"), 500);
    let h = two_providers(t);

    let (status, _, v) = send(&app(&h), get("/feed?category=sports")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(v["error"], "exhausted");
}

#[tokio::test]
async fn admin_refresh_repopulates_the_cache() {
    let h = two_providers(healthy());
    let app = app(&h);

    let (status, _, v) = send(
        &app,
        post("/admin/refresh", Some(json!({ "category": "general" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["articles"], 3);

    let (_, x_cache, _) = send(&app, get("/feed")).await;
    assert_eq!(x_cache.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn admin_refresh_reports_exhaustion() {
    let t = FakeTransport::new();
    t.status(&url_for("a"), 403);
    t.status(&url_for("b"), 403);
    let h = two_providers(t);

    let (status, _, v) = send(
        &app(&h),
        post("/admin/refresh", Some(json!({ "category": "general" }))),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(v["error"], "exhausted");
    assert_eq!(v["attempted"], 2);
    assert_eq!(v["reasons"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn admin_cache_clear_one_signature() {
    let h = two_providers(healthy());
    let app = app(&h);

    send(&app, get("/feed?category=general")).await;
    send(&app, get("/feed?category=general&q=budget")).await;
    assert_eq!(h.kv.len(), 2);

    let (status, _, v) = send(
        &app,
        post(
            "/admin/cache/clear",
            Some(json!({ "signature": { "category": "general", "q": "Budget" } })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["cleared"], "feed:general:budget");
    assert_eq!(h.kv.len(), 1);
}

#[tokio::test]
async fn admin_cache_clear_rejects_bad_json() {
    let h = two_providers(healthy());
    let req = Request::builder()
        .method("POST")
        .uri("/admin/cache/clear")
        .header("content-type", "application/json")
        .body(Body::from("{ nope"))
        .unwrap();
    let (status, _, v) = send(&app(&h), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v["error"].as_str().unwrap_or_default().starts_with("invalid body"));
}

#[tokio::test]
async fn admin_quota_reports_every_provider() {
    let h = two_providers(healthy());
    let app = app(&h);
    send(&app, get("/feed")).await;

    let (status, _, v) = send(&app, get("/admin/quota")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["reliable"], true);
    let providers = v["providers"].as_array().expect("providers");
    assert_eq!(providers.len(), 2);
    let a = providers
        .iter()
        .find(|p| p["provider"] == "a")
        .expect("provider a");
    assert_eq!(a["used_today"], 1);
    assert_eq!(a["daily_cap"], 50);
}

#[tokio::test]
async fn metrics_endpoint_exposes_aggregation_series() {
    let h = two_providers(healthy());
    let app = app(&h);
    send(&app, get("/feed?category=business")).await;

    let resp = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    for needle in ["aggregate_runs_total", "cache_requests_total", "quota_committed_total"] {
        assert!(text.contains(needle), "missing {needle} in /metrics");
    }
}
