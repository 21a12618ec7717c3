// src/api.rs
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::aggregate::RequestClass;
use crate::app::Core;
use crate::cache::{CacheSignature, CacheStatus};
use crate::error::{AggregateError, CacheError};
use crate::metrics::Metrics;
use crate::model::{Article, BatchOutcome, ProviderReport};
use crate::quota::QuotaReport;

const X_CACHE: &str = "x-cache";

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    core: Arc<Core>,
}

pub fn router(core: Arc<Core>, metrics: &Metrics) -> Router {
    let state = AppState { core };

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/feed", get(feed))
        .route("/admin/refresh", post(admin_refresh))
        .route("/admin/cache/clear", post(admin_cache_clear))
        .route("/admin/quota", get(admin_quota))
        .with_state(state)
        .merge(metrics.router())
        .layer(CorsLayer::very_permissive())
}

// ------------------------------------------------------------
// GET /feed
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    domestic_only: Option<bool>,
}

#[derive(Debug, Serialize)]
struct FeedResponse {
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    page: usize,
    page_size: usize,
    total: usize,
    /// Served from the article store because no provider could answer.
    stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<BatchOutcome>,
    articles: Vec<Article>,
    provenance: Vec<ProviderReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_at: Option<DateTime<Utc>>,
}

fn page_of(
    articles: &[Article],
    page: usize,
    page_size: usize,
    domestic_only: bool,
) -> (usize, Vec<Article>) {
    let filtered: Vec<&Article> = articles
        .iter()
        .filter(|a| !domestic_only || a.domestic)
        .collect();
    let total = filtered.len();
    let slice = filtered
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .cloned()
        .collect();
    (total, slice)
}

fn cache_error_label(e: &CacheError) -> &'static str {
    match e {
        CacheError::Compute(AggregateError::Exhausted { .. }) => "exhausted",
        CacheError::WaitTimeout(_) => "wait_timeout",
        CacheError::ComputeAborted => "compute_aborted",
    }
}

async fn feed(State(state): State<AppState>, Query(p): Query<FeedParams>) -> Response {
    let category = p.category.as_deref().unwrap_or("general");
    let sig = CacheSignature::new(category, p.q.as_deref());
    let page = p.page.unwrap_or(1).max(1);
    let page_size = p.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let domestic_only = p.domestic_only.unwrap_or(false);

    match state.core.feed(&sig).await {
        Ok(outcome) => {
            let (total, articles) = page_of(&outcome.batch.articles, page, page_size, domestic_only);
            let body = FeedResponse {
                category: sig.category.clone(),
                query: sig.query.clone(),
                page,
                page_size,
                total,
                stale: outcome.status == CacheStatus::Stale,
                outcome: Some(outcome.batch.outcome),
                articles,
                provenance: outcome.batch.provenance.clone(),
                generated_at: Some(outcome.batch.generated_at),
            };
            with_cache_header(outcome.status, Json(body).into_response())
        }
        Err(e) => {
            let label = cache_error_label(&e);
            tracing::warn!(target: "api", category = %sig.category, error = %e, "feed falling back to article store");
            let limit = state.core.cfg.aggregate.max_target.max(page * page_size);
            let stored = match state
                .core
                .store
                .query(&sig.category, sig.query.as_deref(), limit)
                .await
            {
                Ok(rows) => rows,
                Err(se) => {
                    tracing::error!(target: "api", error = %se, "article store unavailable");
                    Vec::new()
                }
            };
            if stored.is_empty() {
                return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": label })))
                    .into_response();
            }
            let (total, articles) = page_of(&stored, page, page_size, domestic_only);
            let body = FeedResponse {
                category: sig.category.clone(),
                query: sig.query.clone(),
                page,
                page_size,
                total,
                stale: true,
                outcome: None,
                articles,
                provenance: Vec::new(),
                generated_at: None,
            };
            with_cache_header(CacheStatus::Miss, Json(body).into_response())
        }
    }
}

fn with_cache_header(status: CacheStatus, mut resp: Response) -> Response {
    resp.headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    resp
}

// ------------------------------------------------------------
// Admin
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RefreshReq {
    category: String,
    #[serde(default)]
    q: Option<String>,
}

async fn admin_refresh(State(state): State<AppState>, Json(body): Json<RefreshReq>) -> Response {
    let sig = CacheSignature::new(&body.category, body.q.as_deref());
    match state.core.refresh(&sig, RequestClass::ManualRefresh).await {
        Ok(batch) => Json(json!({
            "category": sig.category,
            "query": sig.query,
            "articles": batch.articles.len(),
            "outcome": batch.outcome,
            "provenance": batch.provenance,
        }))
        .into_response(),
        Err(AggregateError::Exhausted { attempted, reasons }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "exhausted", "attempted": attempted, "reasons": reasons })),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClearReq {
    #[serde(default)]
    signature: Option<CacheSignature>,
}

/// An empty body clears everything.
async fn admin_cache_clear(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ClearReq = if body.iter().all(u8::is_ascii_whitespace) {
        ClearReq::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid body: {e}") })),
                )
                    .into_response()
            }
        }
    };
    let sig = req
        .signature
        .map(|s| CacheSignature::new(&s.category, s.query.as_deref()));
    match state.core.cache.invalidate(sig.as_ref()).await {
        Ok(()) => Json(json!({
            "cleared": sig.map(|s| s.key()).unwrap_or_else(|| "all".to_string())
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct QuotaResp {
    reliable: bool,
    providers: Vec<QuotaReport>,
}

async fn admin_quota(State(state): State<AppState>) -> Json<QuotaResp> {
    Json(QuotaResp {
        reliable: state.core.ledger.is_reliable(),
        providers: state.core.ledger.report(),
    })
}
