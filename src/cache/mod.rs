// src/cache/mod.rs
//! Adaptive cache with per-signature single-flight.
//!
//! A hit returns the stored batch. On a miss the first caller becomes the
//! leader: the compute runs in its own task (so a caller that goes away
//! does not cancel it) and every caller for the same signature waits on a
//! broadcast channel for the one result. An entry past its TTL but inside
//! the stale window is returned as `Stale` while one refresh runs behind
//! it. If the key-value backend is unreachable the request is computed
//! directly and marked `Bypass`.
//!
//! Leader tasks are tracked so shutdown can wait for in-flight provider
//! calls (and their quota commits) before the ledger is flushed.

pub mod store;
pub mod ttl;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::error::{AggregateError, CacheError, KvError};
use crate::model::ArticleBatch;
use store::KvStore;
use ttl::TtlPolicy;

/// Identity of a cached feed: category plus normalized query text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSignature {
    pub category: String,
    #[serde(default, alias = "q")]
    pub query: Option<String>,
}

impl CacheSignature {
    pub fn new(category: &str, query: Option<&str>) -> Self {
        let query = query
            .map(|q| q.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
            .filter(|q| !q.is_empty());
        Self {
            category: category.trim().to_ascii_lowercase(),
            query,
        }
    }

    pub fn key(&self) -> String {
        format!(
            "feed:{}:{}",
            self.category,
            self.query.as_deref().unwrap_or("-")
        )
    }
}

/// What is stored under a signature key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub signature: CacheSignature,
    pub batch: ArticleBatch,
    pub ttl_secs: u64,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.inserted_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    /// This caller led the compute.
    Miss,
    /// This caller joined an in-flight compute.
    Shared,
    /// Past its TTL; served while a refresh runs.
    Stale,
    /// Backend unreachable; computed without caching.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Shared => "SHARED",
            CacheStatus::Stale => "STALE",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub batch: Arc<ArticleBatch>,
    pub status: CacheStatus,
}

type Shared = Result<Arc<ArticleBatch>, CacheError>;

pub struct AdaptiveCache {
    kv: Arc<dyn KvStore>,
    policy: TtlPolicy,
    wait_timeout: Duration,
    stale_window: Duration,
    inflight: Mutex<HashMap<String, broadcast::Sender<Shared>>>,
    leaders: Mutex<JoinSet<()>>,
    /// Wall clock at construction paired with tokio's clock, so entry ages
    /// follow tokio time.
    epoch: (DateTime<Utc>, Instant),
}

/// Removes the in-flight entry when the leader task ends, including by
/// panic; waiters then see a closed channel.
struct InflightGuard {
    cache: Arc<AdaptiveCache>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.cache.take_inflight(&self.key);
    }
}

impl AdaptiveCache {
    pub fn new(cfg: &AppConfig, kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            policy: TtlPolicy::new(&cfg.cache, cfg.market.offset()),
            wait_timeout: Duration::from_secs(cfg.cache.wait_timeout_secs.max(1)),
            stale_window: Duration::from_secs(cfg.cache.stale_secs),
            inflight: Mutex::new(HashMap::new()),
            leaders: Mutex::new(JoinSet::new()),
            epoch: (Utc::now(), Instant::now()),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        let (wall, start) = self.epoch;
        wall + chrono::Duration::from_std(start.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    fn take_inflight(&self, key: &str) -> Option<broadcast::Sender<Shared>> {
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Leader tasks not yet reaped.
    pub fn pending_computes(&self) -> usize {
        let mut set = self.leaders.lock().unwrap_or_else(|p| p.into_inner());
        while set.try_join_next().is_some() {}
        set.len()
    }

    /// Wait up to `grace` for running leader tasks. Returns how many were
    /// still running when called; tasks left after `grace` are aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut set = std::mem::take(&mut *self.leaders.lock().unwrap_or_else(|p| p.into_inner()));
        while set.try_join_next().is_some() {}
        let pending = set.len();
        if pending == 0 {
            return 0;
        }
        tracing::info!(target: "cache", pending, "waiting for in-flight computes");
        let all_done = async {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    tracing::warn!(target: "cache", error = %e, "compute task ended abnormally");
                }
            }
        };
        let finished = tokio::time::timeout(grace, all_done).await.is_ok();
        if !finished {
            tracing::warn!(
                target: "cache",
                remaining = set.len(),
                grace_secs = grace.as_secs(),
                "in-flight computes cut off at shutdown"
            );
            set.shutdown().await;
        }
        pending
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, KvError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(target: "cache", key, error = %e, "dropping undecodable cache entry");
                let _ = self.kv.delete(key).await;
                Ok(None)
            }
        }
    }

    /// Store `batch` under `sig` with the TTL the policy gives right now.
    /// The backend keeps it for the stale window on top of that.
    pub async fn put(&self, sig: &CacheSignature, batch: &ArticleBatch) -> Option<Duration> {
        let now = self.now();
        let ttl = self.policy.ttl_for(&sig.category, now);
        let entry = CacheEntry {
            signature: sig.clone(),
            batch: batch.clone(),
            ttl_secs: ttl.as_secs(),
            inserted_at: now,
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(target: "cache", error = %e, "cache entry not serializable");
                return None;
            }
        };
        match self.kv.set(&sig.key(), raw, ttl + self.stale_window).await {
            Ok(()) => {
                tracing::debug!(target: "cache", key = %sig.key(), ttl_secs = ttl.as_secs(), "cache populated");
                Some(ttl)
            }
            Err(e) => {
                counter!("cache_store_errors_total").increment(1);
                tracing::warn!(target: "cache", error = %e, "cache write failed");
                None
            }
        }
    }

    /// Drop one signature, or everything.
    pub async fn invalidate(&self, sig: Option<&CacheSignature>) -> Result<(), KvError> {
        match sig {
            Some(s) => self.kv.delete(&s.key()).await?,
            None => self.kv.clear().await?,
        }
        counter!("cache_invalidations_total").increment(1);
        tracing::info!(
            target: "cache",
            key = %sig.map(|s| s.key()).unwrap_or_else(|| "*".to_string()),
            "cache invalidated"
        );
        Ok(())
    }

    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        sig: &CacheSignature,
        compute: F,
    ) -> Result<CacheOutcome, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ArticleBatch, AggregateError>> + Send + 'static,
    {
        let key = sig.key();

        match self.lookup(&key).await {
            Ok(Some(entry)) if entry.is_fresh(self.now()) => {
                counter!("cache_requests_total", "status" => "hit").increment(1);
                return Ok(CacheOutcome {
                    batch: Arc::new(entry.batch),
                    status: CacheStatus::Hit,
                });
            }
            Ok(Some(entry)) => {
                let (_, started) = self.join_or_lead(sig, &key, compute);
                counter!("cache_requests_total", "status" => "stale").increment(1);
                tracing::debug!(
                    target: "cache",
                    key = %key,
                    refresh_started = started,
                    "serving stale entry"
                );
                return Ok(CacheOutcome {
                    batch: Arc::new(entry.batch),
                    status: CacheStatus::Stale,
                });
            }
            Ok(None) => {}
            Err(e) => {
                counter!("cache_requests_total", "status" => "bypass").increment(1);
                tracing::warn!(target: "cache", key = %key, error = %e, "cache store unavailable; computing directly");
                let batch = compute().await?;
                return Ok(CacheOutcome {
                    batch: Arc::new(batch),
                    status: CacheStatus::Bypass,
                });
            }
        }

        let (mut rx, leader) = self.join_or_lead(sig, &key, compute);
        let status = if leader {
            CacheStatus::Miss
        } else {
            CacheStatus::Shared
        };
        counter!("cache_requests_total", "status" => if leader { "miss" } else { "shared" })
            .increment(1);

        match tokio::time::timeout(self.wait_timeout, rx.recv()).await {
            Err(_) => Err(CacheError::WaitTimeout(self.wait_timeout.as_secs())),
            Ok(Err(_)) => Err(CacheError::ComputeAborted),
            Ok(Ok(Ok(batch))) => Ok(CacheOutcome { batch, status }),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    /// Subscribe to the in-flight compute for `key`, or start one. The
    /// flag is true when this call started it.
    fn join_or_lead<F, Fut>(
        self: &Arc<Self>,
        sig: &CacheSignature,
        key: &str,
        compute: F,
    ) -> (broadcast::Receiver<Shared>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ArticleBatch, AggregateError>> + Send + 'static,
    {
        let rx = {
            let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = map.get(key) {
                return (tx.subscribe(), false);
            }
            let (tx, rx) = broadcast::channel(1);
            map.insert(key.to_string(), tx);
            rx
        };

        let this = Arc::clone(self);
        let sig = sig.clone();
        let key = key.to_string();
        let task = async move {
            let guard = InflightGuard {
                cache: Arc::clone(&this),
                key: key.clone(),
            };
            // A previous leader may have stored a fresh value after our lookup.
            let fresh = match this.lookup(&key).await {
                Ok(Some(entry)) if entry.is_fresh(this.now()) => Some(entry.batch),
                _ => None,
            };
            let result: Shared = match fresh {
                Some(batch) => Ok(Arc::new(batch)),
                None => match compute().await {
                    Ok(batch) => {
                        this.put(&sig, &batch).await;
                        Ok(Arc::new(batch))
                    }
                    Err(e) => {
                        tracing::debug!(target: "cache", key = %key, error = %e, "compute failed");
                        Err(CacheError::Compute(e))
                    }
                },
            };
            // Entry leaves the map before the send so late arrivals
            // either subscribed in time or find the stored value.
            if let Some(tx) = this.take_inflight(&key) {
                let _ = tx.send(result);
            }
            drop(guard);
        };

        let mut leaders = self.leaders.lock().unwrap_or_else(|p| p.into_inner());
        while leaders.try_join_next().is_some() {}
        leaders.spawn(task);
        (rx, true)
    }
}
