// src/scheduler.rs
//! Background jobs: cache refresh for hot categories and quota
//! maintenance (rollover, reload after a failed load, periodic flush).
//! Both stop when the shutdown channel flips to `true`.

use chrono::Utc;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::aggregate::RequestClass;
use crate::app::Core;
use crate::cache::CacheSignature;

pub fn spawn_all(core: Arc<Core>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut jobs = vec![spawn_maintenance(Arc::clone(&core), shutdown.clone())];
    if core.cfg.scheduler.enabled && !core.cfg.scheduler.refresh_categories.is_empty() {
        jobs.push(spawn_refresh(core, shutdown));
    }
    jobs
}

/// Periodically re-aggregate the configured categories as background
/// requests and store the results in the cache.
pub fn spawn_refresh(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(core.cfg.scheduler.refresh_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            refresh_once(&core).await;
        }
        tracing::info!(target: "scheduler", "refresh job stopped");
    })
}

pub async fn refresh_once(core: &Core) -> usize {
    let mut refreshed = 0;
    for category in &core.cfg.scheduler.refresh_categories {
        let sig = CacheSignature::new(category, None);
        match core.refresh(&sig, RequestClass::Background).await {
            Ok(batch) => {
                refreshed += 1;
                counter!("scheduler_refresh_total", "outcome" => "ok").increment(1);
                tracing::info!(
                    target: "scheduler",
                    category = %sig.category,
                    articles = batch.articles.len(),
                    "background refresh"
                );
            }
            Err(e) => {
                counter!("scheduler_refresh_total", "outcome" => "exhausted").increment(1);
                tracing::info!(
                    target: "scheduler",
                    category = %sig.category,
                    error = %e,
                    "background refresh skipped"
                );
            }
        }
    }
    gauge!("scheduler_last_refresh_ts").set(Utc::now().timestamp() as f64);
    refreshed
}

/// Quota rollover checks plus periodic counter flushes.
pub fn spawn_maintenance(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sched = &core.cfg.scheduler;
        let quota = &core.cfg.quota;
        let roll_period = Duration::from_secs(sched.rollover_check_secs.max(1));
        let flush_period = Duration::from_secs(quota.flush_interval_secs.max(1));
        let mut roll = interval_at(Instant::now() + roll_period, roll_period);
        let mut flush = interval_at(Instant::now() + flush_period, flush_period);
        roll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = roll.tick() => {
                    maintain_once(&core).await;
                }
                _ = flush.tick() => {
                    core.ledger.flush_with_retry(quota.reset_retry_attempts).await;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!(target: "scheduler", "maintenance job stopped");
    })
}

/// One rollover pass. Returns how many counters were reset.
pub async fn maintain_once(core: &Core) -> usize {
    if !core.ledger.is_reliable() {
        match core.ledger.reload() {
            Ok(n) => tracing::info!(target: "scheduler", applied = n, "quota counters reloaded"),
            Err(e) => tracing::error!(target: "scheduler", error = %e, "quota counters still unreadable"),
        }
    }
    let changed = core.ledger.rollover(Utc::now());
    if changed > 0 {
        tracing::info!(target: "scheduler", changed, "quota counters rolled over");
        core.ledger
            .flush_with_retry(core.cfg.quota.reset_retry_attempts)
            .await;
    }
    changed
}
