// src/aggregate/mod.rs
//! Aggregation orchestrator.
//!
//! Walks the providers in priority order in waves of at most
//! `aggregate.max_fanout` concurrent calls, classifies what comes back,
//! deduplicates, upserts survivors into the article store and returns the
//! batch together with a per-provider provenance record.

pub mod classify;

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{AggregateConfig, AppConfig};
use crate::dedup::DedupEngine;
use crate::error::{AggregateError, ProviderError};
use crate::model::{Article, ArticleBatch, BatchOutcome, Lane, ProviderReport, ProviderStatus};
use crate::providers::{FetchRequest, ProviderAdapter, Transport};
use crate::quota::{DenyReason, QuotaLedger, UsageLevel};
use crate::registry::SourceRegistry;
use crate::store::ArticleStore;
use classify::{DomesticClassifier, SplitTracker};

/// Who is asking; decides how close to its cap a provider may be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// User-facing feed request: skip providers at critical usage.
    #[default]
    Interactive,
    /// Scheduled refresh: skip providers already at warning usage.
    Background,
    /// Operator-triggered refresh: only the hard cap applies.
    ManualRefresh,
}

impl RequestClass {
    pub fn admits(&self, level: UsageLevel) -> bool {
        match self {
            RequestClass::Interactive => level < UsageLevel::Critical,
            RequestClass::Background => level < UsageLevel::Warning,
            RequestClass::ManualRefresh => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Interactive => "interactive",
            RequestClass::Background => "background",
            RequestClass::ManualRefresh => "manual_refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub category: String,
    pub query: Option<String>,
    /// 0 means the configured default.
    pub target_count: usize,
    pub class: RequestClass,
}

impl AggregateRequest {
    pub fn new(category: impl Into<String>, query: Option<String>, class: RequestClass) -> Self {
        Self {
            category: category.into(),
            query,
            target_count: 0,
            class,
        }
    }
}

pub struct Orchestrator {
    adapters: Vec<Arc<ProviderAdapter>>,
    ledger: Arc<QuotaLedger>,
    dedup: DedupEngine,
    store: Arc<dyn ArticleStore>,
    classifier: DomesticClassifier,
    /// Domestic/global mix of everything served so far.
    split: SplitTracker,
    domestic_target: f64,
    cfg: AggregateConfig,
}

impl Orchestrator {
    pub fn new(
        cfg: &AppConfig,
        registry: &SourceRegistry,
        ledger: Arc<QuotaLedger>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ArticleStore>,
    ) -> Self {
        let adapters = registry
            .ordered()
            .iter()
            .map(|p| {
                Arc::new(ProviderAdapter::new(
                    Arc::clone(p),
                    Arc::clone(&transport),
                    Arc::clone(&ledger),
                ))
            })
            .collect();
        Self {
            adapters,
            ledger,
            dedup: DedupEngine::new(&cfg.dedup),
            store,
            classifier: DomesticClassifier::new(&cfg.split),
            split: SplitTracker::new(cfg.split.domestic_target),
            domestic_target: cfg.split.domestic_target,
            cfg: cfg.aggregate.clone(),
        }
    }

    pub fn adapters(&self) -> &[Arc<ProviderAdapter>] {
        &self.adapters
    }

    /// Served (domestic, global) counts across all runs.
    pub fn split_counts(&self) -> (usize, usize) {
        self.split.counts()
    }

    fn target_for(&self, req: &AggregateRequest) -> usize {
        let t = if req.target_count == 0 {
            self.cfg.default_target
        } else {
            req.target_count
        };
        t.clamp(1, self.cfg.max_target.max(1))
    }

    pub async fn aggregate(&self, req: &AggregateRequest) -> Result<ArticleBatch, AggregateError> {
        let t0 = std::time::Instant::now();
        let target = self.target_for(req);
        let tracker = SplitTracker::seeded(self.domestic_target, self.split.counts());
        let mut provenance: Vec<ProviderReport> = Vec::with_capacity(self.adapters.len());
        let mut reasons: Vec<String> = Vec::new();
        let mut collected: Vec<Article> = Vec::new();
        let mut any_ok = false;

        // Eligibility is decided up front so provenance lists every provider.
        let mut eligible: Vec<&Arc<ProviderAdapter>> = Vec::new();
        for adapter in &self.adapters {
            if let Some(left) = adapter.degraded_for() {
                provenance.push(report(
                    adapter.id(),
                    ProviderStatus::Degraded,
                    0,
                    None,
                    Some(format!("cooling down {}s", left.as_secs())),
                ));
                reasons.push(format!("{}: degraded", adapter.id()));
                continue;
            }
            let level = self.ledger.level(adapter.id());
            if !req.class.admits(level) {
                provenance.push(report(
                    adapter.id(),
                    ProviderStatus::SkippedThreshold,
                    0,
                    None,
                    Some(format!("usage {level:?} for {}", req.class.as_str())),
                ));
                reasons.push(format!("{}: usage threshold", adapter.id()));
                continue;
            }
            eligible.push(adapter);
        }

        let fanout = self.cfg.max_fanout.max(1);
        let mut survivors = 0usize;
        for wave in eligible.chunks(fanout) {
            let lanes = tracker.plan(wave.len(), target);
            let calls = wave.iter().zip(lanes).map(|(adapter, lane)| {
                let fetch = FetchRequest {
                    category: req.category.clone(),
                    query: req.query.clone(),
                    lane,
                    page_size: target,
                };
                async move {
                    let res = fetch_with_lane_fallback(adapter, fetch).await;
                    (adapter, res)
                }
            });

            for (adapter, (lane, res)) in join_all(calls).await {
                match res {
                    Ok(mut articles) => {
                        any_ok = true;
                        for a in articles.iter_mut() {
                            a.domestic = self.classifier.is_domestic(a);
                            tracker.record(a.domestic);
                        }
                        provenance.push(report(
                            adapter.id(),
                            ProviderStatus::Ok,
                            articles.len(),
                            Some(lane),
                            None,
                        ));
                        collected.extend(articles);
                    }
                    Err(e) => {
                        tracing::info!(target: "aggregate", provider = adapter.id(), error = %e, "provider skipped");
                        reasons.push(e.to_string());
                        provenance.push(report(
                            adapter.id(),
                            status_of(&e),
                            0,
                            Some(lane),
                            Some(e.to_string()),
                        ));
                    }
                }
            }

            survivors = self.dedup.survivor_count(&collected);
            if survivors >= target {
                break;
            }
        }

        histogram!("aggregate_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        if !any_ok {
            counter!("aggregate_runs_total", "outcome" => "exhausted").increment(1);
            tracing::warn!(
                target: "aggregate",
                category = %req.category,
                class = req.class.as_str(),
                attempted = provenance.len(),
                "all providers exhausted"
            );
            return Err(AggregateError::Exhausted {
                attempted: provenance.len(),
                reasons,
            });
        }

        let dedup = self.dedup.dedupe_detailed(collected);
        let mut articles = dedup.kept;
        if let Err(e) = self.store.upsert(&articles).await {
            counter!("article_store_errors_total").increment(1);
            tracing::warn!(target: "aggregate", error = %e, "article store upsert failed; serving batch anyway");
        }

        articles.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.key().cmp(&b.key()))
        });
        articles.truncate(target);

        self.split.record_all(&articles);

        let outcome = if articles.is_empty() {
            BatchOutcome::Empty
        } else {
            BatchOutcome::Filled
        };
        let (domestic, global) = self.split.counts();
        counter!(
            "aggregate_runs_total",
            "outcome" => if outcome == BatchOutcome::Filled { "filled" } else { "empty" }
        )
        .increment(1);
        gauge!("aggregate_last_run_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "aggregate",
            category = %req.category,
            class = req.class.as_str(),
            kept = articles.len(),
            survivors,
            removed = dedup.removed,
            ambiguous = dedup.ambiguous,
            domestic,
            global,
            "aggregation finished"
        );

        Ok(ArticleBatch {
            articles,
            outcome,
            provenance,
            generated_at: Utc::now(),
        })
    }
}

/// Under the strict split policy a lane can run out while the other still
/// has room; one retry on the other lane.
async fn fetch_with_lane_fallback(
    adapter: &ProviderAdapter,
    mut fetch: FetchRequest,
) -> (Lane, Result<Vec<Article>, ProviderError>) {
    match adapter.fetch(&fetch).await {
        Err(ProviderError::QuotaDenied {
            reason: DenyReason::LaneShare { .. },
            ..
        }) => {
            fetch.lane = match fetch.lane {
                Lane::Domestic => Lane::Global,
                Lane::Global => Lane::Domestic,
            };
            let res = adapter.fetch(&fetch).await;
            (fetch.lane, res)
        }
        other => (fetch.lane, other),
    }
}

fn status_of(e: &ProviderError) -> ProviderStatus {
    match e {
        ProviderError::Transient { .. } => ProviderStatus::Transient,
        ProviderError::Permanent { .. } => ProviderStatus::Permanent,
        ProviderError::QuotaDenied { .. } => ProviderStatus::QuotaDenied,
        ProviderError::Degraded { .. } => ProviderStatus::Degraded,
    }
}

fn report(
    provider: &str,
    status: ProviderStatus,
    articles: usize,
    lane: Option<Lane>,
    detail: Option<String>,
) -> ProviderReport {
    ProviderReport {
        provider: provider.to_string(),
        status,
        articles,
        lane,
        detail,
    }
}
