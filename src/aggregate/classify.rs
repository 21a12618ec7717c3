// src/aggregate/classify.rs
//! Domestic/global classification and the running split tracker.

use regex::{Regex, RegexBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::SplitConfig;
use crate::model::{Article, Lane};

/// Decides whether an article is domestic: provider country metadata
/// first, keyword match on title/description/tags otherwise.
pub struct DomesticClassifier {
    countries: Vec<String>,
    keywords: Option<Regex>,
}

impl DomesticClassifier {
    pub fn new(cfg: &SplitConfig) -> Self {
        let countries = cfg
            .domestic_countries
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let words: Vec<String> = cfg
            .domestic_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        let keywords = if words.is_empty() {
            None
        } else {
            match RegexBuilder::new(&format!(r"\b(?:{})\b", words.join("|")))
                .case_insensitive(true)
                .build()
            {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(target: "aggregate", error = %e, "domestic keyword list rejected; metadata only");
                    None
                }
            }
        };

        Self { countries, keywords }
    }

    pub fn is_domestic(&self, a: &Article) -> bool {
        if !a.countries.is_empty() {
            return a
                .countries
                .iter()
                .any(|c| self.countries.iter().any(|d| d.eq_ignore_ascii_case(c)));
        }
        let Some(re) = &self.keywords else {
            return false;
        };
        re.is_match(&a.title)
            || a.description.as_deref().is_some_and(|d| re.is_match(d))
            || a.tags.iter().any(|t| re.is_match(t))
    }
}

/// Running domestic/global counts. The orchestrator keeps one for its
/// lifetime and each run plans its waves on a seeded copy.
#[derive(Debug)]
pub struct SplitTracker {
    domestic_target: f64,
    domestic: AtomicUsize,
    global: AtomicUsize,
}

impl SplitTracker {
    pub fn new(domestic_target: f64) -> Self {
        Self {
            domestic_target: domestic_target.clamp(0.0, 1.0),
            domestic: AtomicUsize::new(0),
            global: AtomicUsize::new(0),
        }
    }

    /// Starts from existing counts.
    pub fn seeded(domestic_target: f64, (domestic, global): (usize, usize)) -> Self {
        let t = Self::new(domestic_target);
        t.domestic.store(domestic, Ordering::Relaxed);
        t.global.store(global, Ordering::Relaxed);
        t
    }

    pub fn record_all(&self, articles: &[Article]) {
        for a in articles {
            self.record(a.domestic);
        }
    }

    pub fn record(&self, domestic: bool) {
        if domestic {
            self.domestic.fetch_add(1, Ordering::Relaxed);
        } else {
            self.global.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        (
            self.domestic.load(Ordering::Relaxed),
            self.global.load(Ordering::Relaxed),
        )
    }

    /// The under-represented side.
    pub fn next_lane(&self) -> Lane {
        let (d, g) = self.counts();
        lane_for(self.domestic_target, d, g)
    }

    /// Lanes for `n` requests issued together, assuming each brings
    /// `expected` articles in its own lane.
    pub fn plan(&self, n: usize, expected: usize) -> Vec<Lane> {
        let (mut d, mut g) = self.counts();
        let expected = expected.max(1);
        (0..n)
            .map(|_| {
                let lane = lane_for(self.domestic_target, d, g);
                match lane {
                    Lane::Domestic => d += expected,
                    Lane::Global => g += expected,
                }
                lane
            })
            .collect()
    }
}

fn lane_for(target: f64, domestic: usize, global: usize) -> Lane {
    let total = domestic + global;
    if total == 0 {
        return if target >= 0.5 { Lane::Domestic } else { Lane::Global };
    }
    if (domestic as f64) / (total as f64) < target {
        Lane::Domestic
    } else {
        Lane::Global
    }
}
