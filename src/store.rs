// src/store.rs
//! Durable article store boundary.
//!
//! The aggregation path upserts every surviving batch here; the feed handler
//! reads from it when no provider can answer. Production deployments plug
//! their own database behind `ArticleStore`; `MemoryArticleStore` is the
//! in-process implementation used by the binary and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::DedupConfig;
use crate::dedup::DedupEngine;
use crate::error::StoreError;
use crate::model::{Article, ArticleKey};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert by `(provider, external_id)`. An article that matches a
    /// stored row by key, or duplicates one within the dedup window, is
    /// merged into that row (it only gains richer fields) instead of
    /// being inserted.
    async fn upsert(&self, articles: &[Article]) -> Result<UpsertSummary, StoreError>;

    /// Newest first. `query` is a case-insensitive substring match on the
    /// title and description.
    async fn query(
        &self,
        category: &str,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError>;

    async fn get(&self, key: &ArticleKey) -> Result<Option<Article>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

pub struct MemoryArticleStore {
    rows: RwLock<HashMap<ArticleKey, Article>>,
    dedup: DedupEngine,
}

impl Default for MemoryArticleStore {
    fn default() -> Self {
        Self::with_dedup(DedupEngine::new(&DedupConfig::default()))
    }
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedup(dedup: DedupEngine) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            dedup,
        }
    }

    /// Key of the stored row `a` should merge into, if any. Among several
    /// near-duplicates the closest in publish time wins.
    fn merge_target(&self, rows: &HashMap<ArticleKey, Article>, a: &Article) -> Option<ArticleKey> {
        let key = a.key();
        if rows.contains_key(&key) {
            return Some(key);
        }
        rows.values()
            .filter(|row| self.dedup.is_duplicate(row, a))
            .min_by(|x, y| {
                (x.published_at - a.published_at)
                    .abs()
                    .cmp(&(y.published_at - a.published_at).abs())
                    .then_with(|| x.key().cmp(&y.key()))
            })
            .map(Article::key)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("article store lock poisoned".to_string())
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn upsert(&self, articles: &[Article]) -> Result<UpsertSummary, StoreError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let mut summary = UpsertSummary::default();
        for a in articles {
            match self.merge_target(&rows, a).and_then(|k| rows.get_mut(&k)) {
                Some(existing) => {
                    if existing.key() != a.key() {
                        tracing::debug!(
                            target: "store",
                            kept = %existing.external_id,
                            merged = %a.external_id,
                            "near-duplicate merged into stored row"
                        );
                    }
                    existing.merge_richer(a);
                    summary.updated += 1;
                }
                None => {
                    rows.insert(a.key(), a.clone());
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn query(
        &self,
        category: &str,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let needle = query.map(|q| q.trim().to_lowercase()).filter(|q| !q.is_empty());
        let mut out: Vec<Article> = rows
            .values()
            .filter(|a| a.category == category)
            .filter(|a| match &needle {
                None => true,
                Some(n) => {
                    a.title.to_lowercase().contains(n.as_str())
                        || a
                            .description
                            .as_deref()
                            .is_some_and(|d| d.to_lowercase().contains(n.as_str()))
                }
            })
            .cloned()
            .collect();
        out.sort_by(|x, y| {
            y.published_at
                .cmp(&x.published_at)
                .then_with(|| x.key().cmp(&y.key()))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn get(&self, key: &ArticleKey) -> Result<Option<Article>, StoreError> {
        Ok(self.rows.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows.read().map_err(poisoned)?.len())
    }
}
