// src/app.rs
//! Wiring of the registry, ledger, orchestrator, cache and store. The HTTP
//! layer and the background jobs both go through `Core`.

use anyhow::Context;
use std::sync::Arc;

use crate::aggregate::{AggregateRequest, Orchestrator, RequestClass};
use crate::cache::store::{KvStore, MemoryKvStore};
use crate::cache::{AdaptiveCache, CacheOutcome, CacheSignature};
use crate::config::AppConfig;
use crate::dedup::DedupEngine;
use crate::error::{AggregateError, CacheError};
use crate::model::ArticleBatch;
use crate::providers::{ReqwestTransport, Transport};
use crate::quota::store::{CounterStore, FileCounterStore, MemoryCounterStore};
use crate::quota::QuotaLedger;
use crate::registry::SourceRegistry;
use crate::store::{ArticleStore, MemoryArticleStore};

/// External collaborators; swapped for fakes in tests.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub counters: Arc<dyn CounterStore>,
    pub kv: Arc<dyn KvStore>,
    pub articles: Arc<dyn ArticleStore>,
}

pub struct Core {
    pub cfg: Arc<AppConfig>,
    pub registry: Arc<SourceRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<AdaptiveCache>,
    pub store: Arc<dyn ArticleStore>,
}

impl Core {
    pub fn new(cfg: AppConfig, parts: Collaborators) -> Arc<Self> {
        let registry = Arc::new(SourceRegistry::from_config(&cfg));
        let ledger = QuotaLedger::open(&cfg, &registry, parts.counters);
        let orchestrator = Arc::new(Orchestrator::new(
            &cfg,
            &registry,
            Arc::clone(&ledger),
            parts.transport,
            Arc::clone(&parts.articles),
        ));
        let cache = AdaptiveCache::new(&cfg, parts.kv);
        tracing::info!(
            target: "core",
            providers = registry.len(),
            reliable_counters = ledger.is_reliable(),
            "core ready"
        );
        Arc::new(Self {
            cfg: Arc::new(cfg),
            registry,
            ledger,
            orchestrator,
            cache,
            store: parts.articles,
        })
    }

    /// Production collaborators: reqwest, file-backed counters (memory when
    /// no path is configured), in-process cache and article store.
    pub fn from_config(cfg: AppConfig) -> anyhow::Result<Arc<Self>> {
        let transport = ReqwestTransport::new(&cfg.http).context("creating http transport")?;
        let articles = MemoryArticleStore::with_dedup(DedupEngine::new(&cfg.dedup));
        let counters: Arc<dyn CounterStore> = match &cfg.quota.counter_path {
            Some(p) => Arc::new(FileCounterStore::new(p.clone())),
            None => Arc::new(MemoryCounterStore::new()),
        };
        Ok(Self::new(
            cfg,
            Collaborators {
                transport: Arc::new(transport),
                counters,
                kv: Arc::new(MemoryKvStore::new()),
                articles: Arc::new(articles),
            },
        ))
    }

    pub async fn aggregate(&self, req: &AggregateRequest) -> Result<ArticleBatch, AggregateError> {
        self.orchestrator.aggregate(req).await
    }

    /// Cached feed for user-facing requests.
    pub async fn feed(&self, sig: &CacheSignature) -> Result<CacheOutcome, CacheError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let req = AggregateRequest::new(sig.category.clone(), sig.query.clone(), RequestClass::Interactive);
        self.cache
            .get_or_compute(sig, move || async move { orchestrator.aggregate(&req).await })
            .await
    }

    /// Aggregate past the cache and repopulate it.
    pub async fn refresh(
        &self,
        sig: &CacheSignature,
        class: RequestClass,
    ) -> Result<ArticleBatch, AggregateError> {
        let req = AggregateRequest::new(sig.category.clone(), sig.query.clone(), class);
        let batch = self.orchestrator.aggregate(&req).await?;
        self.cache.put(sig, &batch).await;
        Ok(batch)
    }

    /// Let in-flight cache computes finish (bounded by the shutdown grace),
    /// then flush the ledger.
    pub async fn shutdown(&self) -> bool {
        let grace = std::time::Duration::from_secs(self.cfg.http.shutdown_grace_secs);
        let drained = self.cache.drain(grace).await;
        if drained > 0 {
            tracing::info!(target: "core", drained, "in-flight computes settled");
        }
        let ok = self
            .ledger
            .flush_with_retry(self.cfg.quota.reset_retry_attempts)
            .await;
        tracing::info!(target: "core", flushed = ok, "shutdown complete");
        ok
    }
}
