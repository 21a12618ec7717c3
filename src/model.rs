// src/model.rs
//! Canonical article record and the batch type returned by aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the domestic/global content split a request or article
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Domestic,
    Global,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Domestic => "domestic",
            Lane::Global => "global",
        }
    }
}

/// Ingestion key: unique per provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleKey {
    pub provider: String,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub provider: String,
    /// Provider-scoped identifier.
    pub external_id: String,
    /// Copied from the provider's registry entry at normalization time.
    pub provider_priority: u32,
    pub title: String,
    pub description: Option<String>,
    pub body: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub source_name: Option<String>,
    pub author: Option<String>,
    pub category: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    /// Country codes reported by the provider, lowercased.
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub domestic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Content fingerprint assigned by the dedup engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Article {
    pub fn key(&self) -> ArticleKey {
        ArticleKey {
            provider: self.provider.clone(),
            external_id: self.external_id.clone(),
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.as_deref().map(str::len).unwrap_or(0)
    }

    pub fn has_image(&self) -> bool {
        self.image_url.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Fill empty fields from `other`, and replace the body when `other`
    /// carries a longer one. Identity fields are left untouched.
    pub fn merge_richer(&mut self, other: &Article) {
        fn fill(slot: &mut Option<String>, from: &Option<String>) {
            if slot.as_deref().map_or(true, str::is_empty) {
                if let Some(v) = from.as_deref().filter(|v| !v.is_empty()) {
                    *slot = Some(v.to_string());
                }
            }
        }
        fill(&mut self.description, &other.description);
        fill(&mut self.image_url, &other.image_url);
        fill(&mut self.source_name, &other.source_name);
        fill(&mut self.author, &other.author);
        if other.body_len() > self.body_len() {
            self.body = other.body.clone();
        }
        for t in &other.tags {
            if !self.tags.contains(t) {
                self.tags.push(t.clone());
            }
        }
        if self.relevance.is_none() {
            self.relevance = other.relevance;
        }
        if self.sentiment.is_none() {
            self.sentiment = other.sentiment;
        }
        if other.fingerprint.is_some() {
            self.fingerprint = other.fingerprint.clone();
        }
        self.fetched_at = self.fetched_at.max(other.fetched_at);
    }
}

/// Whether a successful batch carries content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    Filled,
    /// At least one provider answered, but nothing matched.
    Empty,
}

/// Per-provider record of what happened during one aggregation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub provider: String,
    pub status: ProviderStatus,
    pub articles: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Ok,
    QuotaDenied,
    SkippedThreshold,
    Degraded,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleBatch {
    pub articles: Vec<Article>,
    pub outcome: BatchOutcome,
    pub provenance: Vec<ProviderReport>,
    pub generated_at: DateTime<Utc>,
}

impl ArticleBatch {
    /// Providers that contributed at least one surviving article.
    pub fn contributors(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for a in &self.articles {
            if !out.contains(&a.provider.as_str()) {
                out.push(a.provider.as_str());
            }
        }
        out
    }
}
