// src/dedup.rs
//! Near-duplicate suppression across providers.
//!
//! Two articles are duplicates when they were published within the window
//! of each other AND their normalized titles reach the similarity
//! threshold. Input is first sorted by the survivor preference (provider
//! priority, then richer content, then stable identity fields) and reduced
//! greedily, so the surviving set does not depend on input order and a
//! second pass is a no-op.

use chrono::Duration;
use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::config::DedupConfig;
use crate::model::{Article, ArticleKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    /// sha256 (hex, truncated) of the normalized title.
    pub title_hash: String,
    /// Publish time divided by the dedup window.
    pub time_bucket: i64,
    pub survivor: ArticleKey,
}

impl Fingerprint {
    pub fn id(&self) -> String {
        format!("{}:{}", self.title_hash, self.time_bucket)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupReport {
    pub kept: Vec<Article>,
    pub fingerprints: Vec<Fingerprint>,
    pub removed: usize,
    /// In-window pairs scoring just under the threshold; both were kept.
    pub ambiguous: usize,
}

#[derive(Debug, Clone)]
pub struct DedupEngine {
    threshold: f64,
    window: Duration,
    ambiguity_margin: f64,
}

struct Candidate {
    tokens: BTreeSet<String>,
    norm: String,
    article: Article,
}

impl DedupEngine {
    pub fn new(cfg: &DedupConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            window: Duration::seconds(cfg.window_secs.max(0)),
            ambiguity_margin: cfg.ambiguity_margin.max(0.0),
        }
    }

    pub fn dedupe(&self, articles: Vec<Article>) -> Vec<Article> {
        self.dedupe_detailed(articles).kept
    }

    pub fn dedupe_detailed(&self, articles: Vec<Article>) -> DedupReport {
        let report = self.reduce(articles);
        counter!("dedup_removed_total").increment(report.removed as u64);
        counter!("dedup_ambiguous_total").increment(report.ambiguous as u64);
        report
    }

    /// How many articles would survive, without recording metrics.
    pub fn survivor_count(&self, articles: &[Article]) -> usize {
        self.reduce(articles.to_vec()).kept.len()
    }

    fn reduce(&self, articles: Vec<Article>) -> DedupReport {
        let mut items: Vec<Candidate> = articles
            .into_iter()
            .map(|a| {
                let norm = normalize_title(&a.title);
                Candidate {
                    tokens: tokens(&norm),
                    norm,
                    article: a,
                }
            })
            .collect();
        items.sort_by(|x, y| survivor_order(&x.article, &y.article));

        let mut kept: Vec<Candidate> = Vec::with_capacity(items.len());
        let mut removed = 0usize;
        let mut ambiguous = 0usize;
        let ambiguous_floor = self.threshold - self.ambiguity_margin;

        for cand in items {
            let mut duplicate_of: Option<usize> = None;
            for (i, k) in kept.iter().enumerate() {
                if !self.within_window(&cand.article, &k.article) {
                    continue;
                }
                let score = token_set_ratio(&cand.tokens, &k.tokens);
                if score >= self.threshold {
                    duplicate_of = Some(i);
                    break;
                }
                if score >= ambiguous_floor {
                    ambiguous += 1;
                    tracing::debug!(
                        target: "dedup",
                        score,
                        threshold = self.threshold,
                        a = %cand.article.external_id,
                        b = %k.article.external_id,
                        "ambiguous pair kept"
                    );
                }
            }
            match duplicate_of {
                Some(i) => {
                    removed += 1;
                    kept[i].article.merge_richer(&cand.article);
                    tracing::trace!(
                        target: "dedup",
                        dropped = %cand.article.external_id,
                        survivor = %kept[i].article.external_id,
                        "duplicate dropped"
                    );
                }
                None => kept.push(cand),
            }
        }

        // Merging can enrich a survivor; re-sort so a second pass sees the
        // same order.
        kept.sort_by(|x, y| survivor_order(&x.article, &y.article));

        let bucket_secs = self.window.num_seconds().max(1);
        let mut fingerprints = Vec::with_capacity(kept.len());
        let kept: Vec<Article> = kept
            .into_iter()
            .map(|c| {
                let mut a = c.article;
                let fp = Fingerprint {
                    title_hash: title_hash(&c.norm),
                    time_bucket: a.published_at.timestamp().div_euclid(bucket_secs),
                    survivor: a.key(),
                };
                a.fingerprint = Some(fp.id());
                fingerprints.push(fp);
                a
            })
            .collect();

        DedupReport {
            kept,
            fingerprints,
            removed,
            ambiguous,
        }
    }

    /// True when `a` and `b` would collapse into one survivor.
    pub fn is_duplicate(&self, a: &Article, b: &Article) -> bool {
        self.within_window(a, b) && title_similarity(&a.title, &b.title) >= self.threshold
    }

    fn within_window(&self, a: &Article, b: &Article) -> bool {
        (a.published_at - b.published_at).abs() <= self.window
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Survivor preference as a total order: lower priority rank, longer body,
/// has image, earlier publish time, identity fields, then content fields so
/// repeated keys still order deterministically.
fn survivor_order(a: &Article, b: &Article) -> Ordering {
    a.provider_priority
        .cmp(&b.provider_priority)
        .then_with(|| b.body_len().cmp(&a.body_len()))
        .then_with(|| b.has_image().cmp(&a.has_image()))
        .then_with(|| a.published_at.cmp(&b.published_at))
        .then_with(|| a.provider.cmp(&b.provider))
        .then_with(|| a.external_id.cmp(&b.external_id))
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| a.url.cmp(&b.url))
        .then_with(|| a.body.cmp(&b.body))
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| a.image_url.cmp(&b.image_url))
        .then_with(|| a.category.cmp(&b.category))
        .then_with(|| a.source_name.cmp(&b.source_name))
        .then_with(|| a.author.cmp(&b.author))
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_title(s: &str) -> String {
    let lowered: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(norm: &str) -> BTreeSet<String> {
    norm.split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Order-independent similarity in `0.0..=1.0`: the shared tokens (sorted)
/// followed by each side's remaining tokens, compared with normalized
/// Levenshtein.
fn token_set_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common: Vec<&str> = a.intersection(b).map(String::as_str).collect();
    let side = |own: &BTreeSet<String>, other: &BTreeSet<String>| -> String {
        common
            .iter()
            .copied()
            .chain(own.difference(other).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    };
    strsim::normalized_levenshtein(&side(a, b), &side(b, a))
}

/// Similarity of two raw titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    token_set_ratio(&tokens(&normalize_title(a)), &tokens(&normalize_title(b)))
}

fn title_hash(norm: &str) -> String {
    let digest = Sha256::digest(norm.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
