// src/providers/mod.rs
//! Provider adapters.
//!
//! One `ProviderAdapter` per configured provider. The adapter owns the
//! retry loop, failure classification, degradation cool-down and quota
//! bookkeeping; the per-provider request/response shapes live in the
//! `newsapi`, `gnews` and `newsdata` modules and are selected by the closed
//! `ProviderKind` enum.

pub mod gnews;
pub mod newsapi;
pub mod newsdata;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{EndpointKind, HttpConfig, ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::model::{Article, Lane};
use crate::quota::QuotaLedger;

// ------------------------------------------------------------
// Transport
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Never left the host: DNS, refused connection, TLS setup.
    Connect(String),
    /// Sent, but no complete answer in time.
    Timeout(String),
    /// Sent, then the exchange broke (reset, truncated body).
    Io(String),
}

impl TransportError {
    /// Whether the upstream may have counted the request.
    pub fn reached_network(&self) -> bool {
        !matches!(self, TransportError::Connect(_))
    }

    fn message(&self) -> &str {
        match self {
            TransportError::Connect(m) | TransportError::Timeout(m) | TransportError::Io(m) => m,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.as_str())
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .timeout(Duration::from_secs(http.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("building http client: {e}"))?;
        Ok(Self { client })
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_builder() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(classify_reqwest)?;
        Ok(HttpReply { status, body })
    }
}

// ------------------------------------------------------------
// Request / normalization context
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub category: String,
    pub query: Option<String>,
    pub lane: Lane,
    pub page_size: usize,
}

pub(crate) struct NormalizeCtx<'a> {
    pub provider: &'a ProviderConfig,
    pub request: &'a FetchRequest,
    pub fetched_at: DateTime<Utc>,
}

impl NormalizeCtx<'_> {
    /// Country metadata implied by the request when the provider does not
    /// report one per article.
    pub fn implied_countries(&self) -> Vec<String> {
        match (self.request.lane, &self.provider.domestic_country) {
            (Lane::Domestic, Some(c)) => vec![c.to_ascii_lowercase()],
            _ => Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn article(
        &self,
        external_id: String,
        title: String,
        url: String,
        description: Option<String>,
        body: Option<String>,
        image_url: Option<String>,
        source_name: Option<String>,
        author: Option<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Article {
        Article {
            provider: self.provider.id.clone(),
            external_id,
            provider_priority: self.provider.priority,
            title,
            description,
            body,
            url,
            image_url,
            source_name,
            author,
            category: self.request.category.clone(),
            published_at: published_at.unwrap_or(self.fetched_at),
            fetched_at: self.fetched_at,
            countries: self.implied_countries(),
            domestic: false,
            relevance: None,
            sentiment: None,
            tags: Vec::new(),
            fingerprint: None,
        }
    }
}

impl ProviderKind {
    fn build_query(&self, cfg: &ProviderConfig, req: &FetchRequest) -> Vec<(String, String)> {
        match self {
            ProviderKind::NewsApi => newsapi::query(cfg, req),
            ProviderKind::GNews => gnews::query(cfg, req),
            ProviderKind::NewsData => newsdata::query(cfg, req),
        }
    }

    fn parse(&self, body: &str, ctx: &NormalizeCtx<'_>) -> Result<Vec<Article>, String> {
        match self {
            ProviderKind::NewsApi => newsapi::parse(body, ctx),
            ProviderKind::GNews => gnews::parse(body, ctx),
            ProviderKind::NewsData => newsdata::parse(body, ctx),
        }
    }
}

// ------------------------------------------------------------
// Adapter
// ------------------------------------------------------------

enum StatusClass {
    Success,
    Transient(String),
    Permanent(String),
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Transient(format!("http {status}")),
        500..=599 => StatusClass::Transient(format!("http {status}")),
        401 | 403 => StatusClass::Permanent(format!("http {status}: credentials rejected")),
        400..=499 => StatusClass::Permanent(format!("http {status}: request rejected")),
        _ => StatusClass::Transient(format!("unexpected http {status}")),
    }
}

pub struct ProviderAdapter {
    cfg: Arc<ProviderConfig>,
    transport: Arc<dyn Transport>,
    ledger: Arc<QuotaLedger>,
    degraded_until: Mutex<Option<Instant>>,
}

impl ProviderAdapter {
    pub fn new(
        cfg: Arc<ProviderConfig>,
        transport: Arc<dyn Transport>,
        ledger: Arc<QuotaLedger>,
    ) -> Self {
        Self {
            cfg,
            transport,
            ledger,
            degraded_until: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.cfg
    }

    /// Remaining cool-down after a permanent failure, if any.
    pub fn degraded_for(&self) -> Option<Duration> {
        let mut g = self.degraded_until.lock().unwrap_or_else(|p| p.into_inner());
        match *g {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Some(until - now)
                } else {
                    *g = None;
                    None
                }
            }
            None => None,
        }
    }

    pub fn mark_degraded(&self, reason: &str) {
        let until = Instant::now() + Duration::from_secs(self.cfg.cooldown_secs);
        *self.degraded_until.lock().unwrap_or_else(|p| p.into_inner()) = Some(until);
        counter!("provider_degraded_total", "provider" => self.cfg.id.clone()).increment(1);
        tracing::warn!(
            target: "provider",
            provider = %self.cfg.id,
            cooldown_secs = self.cfg.cooldown_secs,
            reason,
            "provider degraded; check its configuration"
        );
    }

    fn backoff(&self) -> ExponentialBackoff {
        let base = Duration::from_secs(self.cfg.retry.backoff_secs);
        ExponentialBackoff {
            current_interval: base,
            initial_interval: base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: base * 32,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Fetch and normalize one page of articles. Every attempt reserves one
    /// quota unit; the unit is committed only if the request reached the
    /// provider.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<Vec<Article>, ProviderError> {
        let id = self.cfg.id.as_str();
        if let Some(left) = self.degraded_for() {
            return Err(ProviderError::Degraded {
                provider: id.to_string(),
                remaining_secs: left.as_secs(),
            });
        }

        let kind = if req.query.is_some() {
            EndpointKind::Search
        } else {
            EndpointKind::Headlines
        };
        let Some(endpoint) = self.cfg.endpoint(kind) else {
            return Err(self.permanent("no endpoint configured".to_string()));
        };
        let params = self.cfg.kind.build_query(&self.cfg, req);
        let mut backoff = self.backoff();
        let max_attempts = self.cfg.retry.max_attempts.max(1);
        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=max_attempts {
            let reservation = match self.ledger.try_reserve(id, req.lane, 1) {
                Ok(r) => r,
                Err(reason) => {
                    // Retries stop as soon as quota runs out.
                    return Err(last_err.unwrap_or(ProviderError::QuotaDenied {
                        provider: id.to_string(),
                        reason,
                    }));
                }
            };

            let t0 = std::time::Instant::now();
            let outcome = self.transport.get(&endpoint.url, &params).await;
            histogram!("provider_call_ms", "provider" => id.to_string())
                .record(t0.elapsed().as_secs_f64() * 1_000.0);

            let err = match outcome {
                Err(te) => {
                    if te.reached_network() {
                        reservation.commit();
                    } else {
                        reservation.release();
                    }
                    self.transient(format!("transport: {}", te.message()))
                }
                Ok(reply) => {
                    reservation.commit();
                    match classify_status(reply.status) {
                        StatusClass::Success => {
                            let ctx = NormalizeCtx {
                                provider: &self.cfg,
                                request: req,
                                fetched_at: Utc::now(),
                            };
                            return match self.cfg.kind.parse(&reply.body, &ctx) {
                                Ok(articles) => {
                                    counter!("provider_calls_total", "provider" => id.to_string(), "outcome" => "ok")
                                        .increment(1);
                                    tracing::debug!(
                                        target: "provider",
                                        provider = id,
                                        attempt,
                                        articles = articles.len(),
                                        "provider fetch ok"
                                    );
                                    Ok(articles)
                                }
                                Err(msg) => Err(self.permanent(format!("undecodable body: {msg}"))),
                            };
                        }
                        StatusClass::Permanent(msg) => return Err(self.permanent(msg)),
                        StatusClass::Transient(msg) => self.transient(msg),
                    }
                }
            };

            tracing::warn!(target: "provider", provider = id, attempt, max_attempts, error = %err, "provider attempt failed");
            last_err = Some(err);
            if attempt < max_attempts {
                let delay = backoff.next_backoff().unwrap_or(backoff.initial_interval);
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err.unwrap_or_else(|| self.transient("no attempt made".to_string())))
    }

    fn transient(&self, message: String) -> ProviderError {
        counter!("provider_calls_total", "provider" => self.cfg.id.clone(), "outcome" => "transient")
            .increment(1);
        ProviderError::Transient {
            provider: self.cfg.id.clone(),
            message,
        }
    }

    fn permanent(&self, message: String) -> ProviderError {
        counter!("provider_calls_total", "provider" => self.cfg.id.clone(), "outcome" => "permanent")
            .increment(1);
        self.mark_degraded(&message);
        ProviderError::Permanent {
            provider: self.cfg.id.clone(),
            message,
        }
    }
}

// ------------------------------------------------------------
// Text helpers shared by the shape modules
// ------------------------------------------------------------

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_TRUNCATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(\.\.\.|…)?\s*\[\+\d+ chars\]\s*$").expect("truncation regex"));

/// Decode entities, strip tags, normalize typographic quotes and collapse
/// whitespace. Empty results become `None`.
pub fn normalize_text(s: &str) -> Option<String> {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, " ");
    let quoted = stripped
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    let out = RE_WS.replace_all(&quoted, " ").trim().to_string();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

pub(crate) fn normalize_opt(s: Option<&str>) -> Option<String> {
    s.and_then(normalize_text)
}

/// Drop the `[+1234 chars]` truncation marker some providers append.
pub(crate) fn strip_truncation(s: String) -> String {
    RE_TRUNCATED.replace(&s, "").trim_end().to_string()
}

pub(crate) fn parse_rfc3339(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// `"YYYY-MM-DD HH:MM:SS"` in UTC.
pub(crate) fn parse_sql_utc(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|v| NaiveDateTime::parse_from_str(v.trim(), "%Y-%m-%d %H:%M:%S").ok())
        .map(|n| n.and_utc())
}

/// Stable external id for providers that do not issue one.
pub(crate) fn url_id(url: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(url.trim().as_bytes());
    digest.iter().take(12).map(|b| format!("{b:02x}")).collect()
}
