// src/quota/mod.rs
//! Quota ledger: per-provider daily/hourly usage counters with atomic
//! admission.
//!
//! Admission is a two-step protocol. `try_reserve` checks
//! `used + pending + cost` against every applicable cap under the
//! provider's counter lock and records the units as pending; the returned
//! [`Reservation`] is either committed (the upstream call happened) or
//! dropped (nothing reached the network), which releases the units. Two
//! concurrent callers can therefore never both be admitted for a single
//! remaining unit.

pub mod store;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{AppConfig, ProviderConfig, SplitPolicy};
use crate::model::Lane;
use crate::registry::SourceRegistry;
use store::CounterStore;

/// Persisted usage for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub provider: String,
    /// Quota day: the local calendar date, shifted by the reset hour.
    pub day: NaiveDate,
    pub used_today: u32,
    /// Local hours since the epoch.
    pub hour_bucket: i64,
    pub used_this_hour: u32,
    #[serde(default)]
    pub used_domestic: u32,
    #[serde(default)]
    pub used_global: u32,
    pub last_reset: DateTime<Utc>,
}

impl QuotaCounter {
    fn fresh(provider: &str, day: NaiveDate, hour_bucket: i64, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            day,
            used_today: 0,
            hour_bucket,
            used_this_hour: 0,
            used_domestic: 0,
            used_global: 0,
            last_reset: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    DailyCap { used: u32, cap: u32 },
    HourlyCap { used: u32, cap: u32 },
    LaneShare { lane: Lane, used: u32, cap: u32 },
    UnknownProvider,
    /// Counters could not be loaded reliably; admission fails closed.
    CountersUnavailable,
}

impl DenyReason {
    fn label(&self) -> &'static str {
        match self {
            DenyReason::DailyCap { .. } => "daily_cap",
            DenyReason::HourlyCap { .. } => "hourly_cap",
            DenyReason::LaneShare { .. } => "lane_share",
            DenyReason::UnknownProvider => "unknown_provider",
            DenyReason::CountersUnavailable => "counters_unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::DailyCap { used, cap } => write!(f, "daily cap reached ({used}/{cap})"),
            DenyReason::HourlyCap { used, cap } => write!(f, "hourly cap reached ({used}/{cap})"),
            DenyReason::LaneShare { lane, used, cap } => {
                write!(f, "{} share reached ({used}/{cap})", lane.as_str())
            }
            DenyReason::UnknownProvider => write!(f, "unknown provider"),
            DenyReason::CountersUnavailable => write!(f, "quota counters unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    pub provider: String,
    pub priority: u32,
    pub day: NaiveDate,
    pub used_today: u32,
    pub daily_cap: u32,
    pub used_this_hour: u32,
    pub hourly_cap: Option<u32>,
    pub used_domestic: u32,
    pub used_global: u32,
    pub pending: u32,
    pub usage_ratio: f64,
    pub level: UsageLevel,
}

#[derive(Debug)]
struct SlotState {
    counter: QuotaCounter,
    pending: u32,
    pending_domestic: u32,
    pending_global: u32,
}

struct Slot {
    cfg: Arc<ProviderConfig>,
    state: Mutex<SlotState>,
}

pub struct QuotaLedger {
    slots: HashMap<String, Slot>,
    offset: FixedOffset,
    warning_ratio: f64,
    critical_ratio: f64,
    split_policy: SplitPolicy,
    store: Arc<dyn CounterStore>,
    reliable: AtomicBool,
    dirty: AtomicBool,
}

impl QuotaLedger {
    /// Build the ledger and seed it from the counter store. A store that
    /// cannot be read leaves the ledger failing closed until [`reload`]
    /// succeeds.
    ///
    /// [`reload`]: QuotaLedger::reload
    pub fn open(
        cfg: &AppConfig,
        registry: &SourceRegistry,
        store: Arc<dyn CounterStore>,
    ) -> Arc<Self> {
        Self::open_at(cfg, registry, store, Utc::now())
    }

    pub fn open_at(
        cfg: &AppConfig,
        registry: &SourceRegistry,
        store: Arc<dyn CounterStore>,
        now: DateTime<Utc>,
    ) -> Arc<Self> {
        let offset = cfg.market.offset();
        let slots = registry
            .ordered()
            .iter()
            .map(|p| {
                let day = quota_day(now, offset, p.reset_hour);
                let state = SlotState {
                    counter: QuotaCounter::fresh(&p.id, day, hour_bucket(now, offset), now),
                    pending: 0,
                    pending_domestic: 0,
                    pending_global: 0,
                };
                (
                    p.id.clone(),
                    Slot {
                        cfg: Arc::clone(p),
                        state: Mutex::new(state),
                    },
                )
            })
            .collect();

        let ledger = Arc::new(Self {
            slots,
            offset,
            warning_ratio: cfg.quota.warning_ratio,
            critical_ratio: cfg.quota.critical_ratio,
            split_policy: cfg.split.policy,
            store,
            reliable: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        });
        if let Err(e) = ledger.reload_at(now) {
            tracing::error!(target: "quota", error = %e, "quota counters unreadable; admission fails closed");
        }
        ledger
    }

    /// Re-read counters from the store. On success the ledger accepts
    /// admissions again.
    pub fn reload(&self) -> Result<usize, crate::error::LedgerError> {
        self.reload_at(Utc::now())
    }

    fn reload_at(&self, now: DateTime<Utc>) -> Result<usize, crate::error::LedgerError> {
        let loaded = self.store.load()?;
        let mut applied = 0usize;
        for c in loaded {
            let Some(slot) = self.slots.get(&c.provider) else {
                continue;
            };
            let mut st = lock_recover(&slot.state);
            // Never lower in-memory usage that was recorded since startup.
            if c.day == st.counter.day {
                st.counter.used_today = st.counter.used_today.max(c.used_today);
                st.counter.used_domestic = st.counter.used_domestic.max(c.used_domestic);
                st.counter.used_global = st.counter.used_global.max(c.used_global);
                if c.hour_bucket == st.counter.hour_bucket {
                    st.counter.used_this_hour = st.counter.used_this_hour.max(c.used_this_hour);
                }
                st.counter.last_reset = c.last_reset;
                applied += 1;
            }
            self.roll(&slot.cfg, &mut st, now);
        }
        self.reliable.store(true, Ordering::SeqCst);
        Ok(applied)
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable.load(Ordering::SeqCst)
    }

    pub fn try_reserve(
        self: &Arc<Self>,
        provider: &str,
        lane: Lane,
        cost: u32,
    ) -> Result<Reservation, DenyReason> {
        self.try_reserve_at(provider, lane, cost, Utc::now())
    }

    pub fn try_reserve_at(
        self: &Arc<Self>,
        provider: &str,
        lane: Lane,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DenyReason> {
        let result = self.admit(provider, lane, cost, now);
        if let Err(reason) = &result {
            counter!("quota_denied_total", "provider" => provider.to_string(), "reason" => reason.label())
                .increment(1);
            tracing::debug!(target: "quota", provider, %reason, "admission denied");
        }
        result
    }

    fn admit(
        self: &Arc<Self>,
        provider: &str,
        lane: Lane,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DenyReason> {
        if !self.is_reliable() {
            return Err(DenyReason::CountersUnavailable);
        }
        let slot = self.slots.get(provider).ok_or(DenyReason::UnknownProvider)?;
        // A poisoned counter cannot be trusted; deny rather than overrun.
        let mut st = slot
            .state
            .lock()
            .map_err(|_| DenyReason::CountersUnavailable)?;
        self.roll(&slot.cfg, &mut st, now);

        let cfg = &slot.cfg;
        let daily = st.counter.used_today + st.pending;
        if daily.saturating_add(cost) > cfg.daily_cap {
            return Err(DenyReason::DailyCap {
                used: daily,
                cap: cfg.daily_cap,
            });
        }
        if let Some(hcap) = cfg.hourly_cap {
            let hourly = st.counter.used_this_hour + st.pending;
            if hourly.saturating_add(cost) > hcap {
                return Err(DenyReason::HourlyCap {
                    used: hourly,
                    cap: hcap,
                });
            }
        }
        if self.split_policy == SplitPolicy::Strict {
            let (used, cap) = match lane {
                Lane::Domestic => (
                    st.counter.used_domestic + st.pending_domestic,
                    domestic_cap(cfg),
                ),
                Lane::Global => (
                    st.counter.used_global + st.pending_global,
                    cfg.daily_cap - domestic_cap(cfg),
                ),
            };
            if used.saturating_add(cost) > cap {
                return Err(DenyReason::LaneShare { lane, used, cap });
            }
        }

        st.pending += cost;
        match lane {
            Lane::Domestic => st.pending_domestic += cost,
            Lane::Global => st.pending_global += cost,
        }
        Ok(Reservation {
            ledger: Arc::clone(self),
            provider: provider.to_string(),
            lane,
            cost,
            settled: false,
        })
    }

    fn settle(&self, provider: &str, lane: Lane, cost: u32, commit: bool) {
        let Some(slot) = self.slots.get(provider) else {
            return;
        };
        let ratio;
        {
            let mut st = lock_recover(&slot.state);
            st.pending = st.pending.saturating_sub(cost);
            match lane {
                Lane::Domestic => st.pending_domestic = st.pending_domestic.saturating_sub(cost),
                Lane::Global => st.pending_global = st.pending_global.saturating_sub(cost),
            }
            if !commit {
                return;
            }
            // Counts toward whatever quota day the counter is on; a pending
            // rollover zeroes it on the next admission.
            st.counter.used_today += cost;
            st.counter.used_this_hour += cost;
            match lane {
                Lane::Domestic => st.counter.used_domestic += cost,
                Lane::Global => st.counter.used_global += cost,
            }
            ratio = ratio_of(&slot.cfg, &st);
        }
        self.dirty.store(true, Ordering::SeqCst);
        counter!("quota_committed_total", "provider" => provider.to_string()).increment(cost as u64);
        gauge!("quota_usage_ratio", "provider" => provider.to_string()).set(ratio);
    }

    /// Zero the counters of a slot whose quota day or hour is over.
    /// Runs with the slot lock held.
    fn roll(&self, cfg: &ProviderConfig, st: &mut SlotState, now: DateTime<Utc>) -> bool {
        let day = quota_day(now, self.offset, cfg.reset_hour);
        let hour = hour_bucket(now, self.offset);
        let mut changed = false;
        if st.counter.day != day {
            tracing::info!(
                target: "quota",
                provider = %cfg.id,
                previous_day = %st.counter.day,
                used = st.counter.used_today,
                "daily quota rollover"
            );
            st.counter = QuotaCounter::fresh(&cfg.id, day, hour, now);
            changed = true;
        } else if st.counter.hour_bucket != hour {
            st.counter.hour_bucket = hour;
            st.counter.used_this_hour = 0;
            changed = true;
        }
        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        changed
    }

    /// Scheduled reset. Idempotent: a counter already on the current quota
    /// day/hour is left untouched. Returns how many counters changed.
    pub fn rollover(&self, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for slot in self.slots.values() {
            let mut st = lock_recover(&slot.state);
            if self.roll(&slot.cfg, &mut st, now) {
                changed += 1;
            }
        }
        changed
    }

    pub fn usage_ratio(&self, provider: &str) -> f64 {
        self.usage_ratio_at(provider, Utc::now())
    }

    /// max(daily, hourly) usage including in-flight reservations. Unknown
    /// providers and unreliable counters report 1.0.
    pub fn usage_ratio_at(&self, provider: &str, now: DateTime<Utc>) -> f64 {
        if !self.is_reliable() {
            return 1.0;
        }
        let Some(slot) = self.slots.get(provider) else {
            return 1.0;
        };
        let mut st = lock_recover(&slot.state);
        self.roll(&slot.cfg, &mut st, now);
        ratio_of(&slot.cfg, &st)
    }

    pub fn level(&self, provider: &str) -> UsageLevel {
        self.level_for_ratio(self.usage_ratio(provider))
    }

    pub fn level_at(&self, provider: &str, now: DateTime<Utc>) -> UsageLevel {
        self.level_for_ratio(self.usage_ratio_at(provider, now))
    }

    pub fn level_for_ratio(&self, ratio: f64) -> UsageLevel {
        if ratio >= self.critical_ratio {
            UsageLevel::Critical
        } else if ratio >= self.warning_ratio {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    pub fn report(&self) -> Vec<QuotaReport> {
        let now = Utc::now();
        let mut out: Vec<QuotaReport> = self
            .slots
            .values()
            .map(|slot| {
                let mut st = lock_recover(&slot.state);
                self.roll(&slot.cfg, &mut st, now);
                let ratio = if self.is_reliable() {
                    ratio_of(&slot.cfg, &st)
                } else {
                    1.0
                };
                QuotaReport {
                    provider: slot.cfg.id.clone(),
                    priority: slot.cfg.priority,
                    day: st.counter.day,
                    used_today: st.counter.used_today,
                    daily_cap: slot.cfg.daily_cap,
                    used_this_hour: st.counter.used_this_hour,
                    hourly_cap: slot.cfg.hourly_cap,
                    used_domestic: st.counter.used_domestic,
                    used_global: st.counter.used_global,
                    pending: st.pending,
                    usage_ratio: ratio,
                    level: self.level_for_ratio(ratio),
                }
            })
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.provider.cmp(&b.provider)));
        out
    }

    /// Current counter snapshot.
    pub fn counters(&self) -> Vec<QuotaCounter> {
        let mut out: Vec<QuotaCounter> = self
            .slots
            .values()
            .map(|s| lock_recover(&s.state).counter.clone())
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Persist counters if anything changed since the last flush.
    pub fn flush(&self) -> Result<bool, crate::error::LedgerError> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        // A failed load must not be overwritten with partial state.
        if !self.is_reliable() {
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        let snapshot = self.counters();
        if let Err(e) = self.store.save(&snapshot) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    /// Flush with bounded retries; errors are logged, never propagated.
    pub async fn flush_with_retry(&self, attempts: u32) -> bool {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.flush() {
                Ok(_) => return true,
                Err(e) => {
                    counter!("quota_flush_failures_total").increment(1);
                    tracing::error!(target: "quota", attempt, error = %e, "quota counter flush failed");
                    if attempt < attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64))
                            .await;
                    }
                }
            }
        }
        false
    }
}

/// Units reserved against a provider's quota. Commit after the upstream
/// call happened; drop to release.
#[must_use = "a reservation is released when dropped"]
pub struct Reservation {
    ledger: Arc<QuotaLedger>,
    provider: String,
    lane: Lane,
    cost: u32,
    settled: bool,
}

impl Reservation {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn commit(mut self) {
        self.settled = true;
        self.ledger.settle(&self.provider, self.lane, self.cost, true);
    }

    pub fn release(mut self) {
        self.settled = true;
        self.ledger.settle(&self.provider, self.lane, self.cost, false);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle(&self.provider, self.lane, self.cost, false);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("provider", &self.provider)
            .field("lane", &self.lane)
            .field("cost", &self.cost)
            .finish()
    }
}

fn lock_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn ratio_of(cfg: &ProviderConfig, st: &SlotState) -> f64 {
    let daily = (st.counter.used_today + st.pending) as f64 / cfg.daily_cap as f64;
    let hourly = cfg
        .hourly_cap
        .map(|h| (st.counter.used_this_hour + st.pending) as f64 / h as f64)
        .unwrap_or(0.0);
    daily.max(hourly)
}

fn domestic_cap(cfg: &ProviderConfig) -> u32 {
    ((cfg.daily_cap as f64) * cfg.domestic_share).floor() as u32
}

/// The quota day a timestamp falls in: local date after subtracting the
/// reset hour, so usage before the reset hour counts toward the previous day.
pub fn quota_day(now: DateTime<Utc>, offset: FixedOffset, reset_hour: u32) -> NaiveDate {
    (now.with_timezone(&offset) - Duration::hours(reset_hour as i64)).date_naive()
}

pub fn hour_bucket(now: DateTime<Utc>, offset: FixedOffset) -> i64 {
    (now.timestamp() + offset.local_minus_utc() as i64).div_euclid(3600)
}
