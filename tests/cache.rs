// tests/cache.rs
//
// Adaptive cache behaviour:
// - N concurrent callers for one signature trigger exactly one compute
// - TTL boundaries on tokio's paused clock (hit at 299s, recompute at 301s)
// - past the TTL an entry is served STALE while a single refresh runs
// - compute errors reach every waiter and are not cached
// - an abandoned caller does not cancel the compute
// - a panicking compute surfaces as ComputeAborted
// - an unreachable backend degrades to direct compute (BYPASS)
// - invalidate(one) / invalidate(all)
// - finance TTL inside market hours never exceeds the TTL outside

mod common;

use chrono::{Datelike, NaiveDate, Weekday};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::DownKv;
use newsdesk::cache::store::MemoryKvStore;
use newsdesk::config::AppConfig;
use newsdesk::error::{AggregateError, CacheError};
use newsdesk::model::{ArticleBatch, BatchOutcome, ProviderReport, ProviderStatus};
use newsdesk::{AdaptiveCache, CacheSignature, CacheStatus};

fn batch(tag: &str) -> ArticleBatch {
    ArticleBatch {
        articles: vec![],
        outcome: BatchOutcome::Empty,
        provenance: vec![ProviderReport {
            provider: tag.to_string(),
            status: ProviderStatus::Ok,
            articles: 0,
            lane: None,
            detail: None,
        }],
        generated_at: chrono::Utc::now(),
    }
}

fn cache_with_slow_ttl(secs: u64) -> (Arc<AdaptiveCache>, Arc<MemoryKvStore>) {
    cache_with(secs, AppConfig::default().cache.stale_secs)
}

fn cache_with(ttl_secs: u64, stale_secs: u64) -> (Arc<AdaptiveCache>, Arc<MemoryKvStore>) {
    let mut cfg = AppConfig::default();
    cfg.cache.ttl.slow_moving = ttl_secs;
    cfg.cache.stale_secs = stale_secs;
    let kv = Arc::new(MemoryKvStore::new());
    (AdaptiveCache::new(&cfg, kv.clone()), kv)
}

/// Compute that tags its batch, counting invocations.
fn tagged(
    counter: &Arc<AtomicUsize>,
    tag: &'static str,
    delay: Duration,
) -> impl FnOnce() -> BoxedCompute + Send + 'static {
    let counter = counter.clone();
    move || {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(batch(tag))
        })
    }
}

type BoxedCompute = Pin<Box<dyn Future<Output = Result<ArticleBatch, AggregateError>> + Send>>;

/// Compute closure that counts its invocations.
fn counting(
    counter: &Arc<AtomicUsize>,
    delay: Duration,
) -> impl FnOnce() -> BoxedCompute + Send + 'static {
    let counter = counter.clone();
    move || {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(batch("computed"))
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_compute() {
    let (cache, _kv) = cache_with_slow_ttl(600);
    let sig = CacheSignature::new("technology", None);
    let computes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let cache = cache.clone();
        let sig = sig.clone();
        let f = counting(&computes, Duration::from_millis(100));
        handles.push(tokio::spawn(async move { cache.get_or_compute(&sig, f).await }));
    }

    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.expect("join").expect("cache outcome"));
    }

    assert_eq!(computes.load(Ordering::SeqCst), 1, "exactly one compute");
    let misses = outcomes.iter().filter(|o| o.status == CacheStatus::Miss).count();
    assert_eq!(misses, 1, "exactly one leader");
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.status, CacheStatus::Miss | CacheStatus::Shared | CacheStatus::Hit)));
    assert!(outcomes.iter().all(|o| o.batch.provenance[0].provider == "computed"));
    assert_eq!(cache.inflight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn entry_is_served_until_ttl_then_recomputed() {
    let (cache, _kv) = cache_with(300, 0);
    let sig = CacheSignature::new("technology", None);
    let computes = Arc::new(AtomicUsize::new(0));

    let first = cache
        .get_or_compute(&sig, counting(&computes, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(first.status, CacheStatus::Miss);

    tokio::time::advance(Duration::from_secs(299)).await;
    let hit = cache
        .get_or_compute(&sig, counting(&computes, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(hit.status, CacheStatus::Hit);
    assert_eq!(computes.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let again = cache
        .get_or_compute(&sig, counting(&computes, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(again.status, CacheStatus::Miss);
    assert_eq!(computes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_served_stale_while_one_refresh_runs() {
    let (cache, _kv) = cache_with(300, 600);
    let sig = CacheSignature::new("technology", None);
    let computes = Arc::new(AtomicUsize::new(0));

    let first = cache
        .get_or_compute(&sig, tagged(&computes, "v1", Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(first.status, CacheStatus::Miss);

    tokio::time::advance(Duration::from_secs(301)).await;
    for _ in 0..3 {
        let stale = cache
            .get_or_compute(&sig, tagged(&computes, "v2", Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(stale.status, CacheStatus::Stale);
        assert_eq!(stale.batch.provenance[0].provider, "v1");
    }
    assert_eq!(cache.inflight_len(), 1, "one refresh behind the stale entry");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let fresh = cache
        .get_or_compute(&sig, tagged(&computes, "v3", Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(fresh.status, CacheStatus::Hit);
    assert_eq!(fresh.batch.provenance[0].provider, "v2");
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    assert_eq!(cache.pending_computes(), 0);
}

#[tokio::test(start_paused = true)]
async fn entry_past_the_stale_window_is_a_miss() {
    let (cache, _kv) = cache_with(300, 600);
    let sig = CacheSignature::new("technology", None);
    let computes = Arc::new(AtomicUsize::new(0));

    cache
        .get_or_compute(&sig, tagged(&computes, "v1", Duration::ZERO))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(901)).await;
    let out = cache
        .get_or_compute(&sig, tagged(&computes, "v2", Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(out.status, CacheStatus::Miss);
    assert_eq!(out.batch.provenance[0].provider, "v2");
}

#[tokio::test]
async fn compute_errors_reach_all_waiters_and_are_not_cached() {
    let (cache, kv) = cache_with_slow_ttl(600);
    let sig = CacheSignature::new("technology", Some("chips"));

    let failing = || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err::<ArticleBatch, _>(AggregateError::Exhausted {
            attempted: 2,
            reasons: vec!["a: degraded".into(), "b: degraded".into()],
        })
    };
    let (x, y) = tokio::join!(
        cache.get_or_compute(&sig, failing),
        cache.get_or_compute(&sig, failing)
    );
    for r in [x, y] {
        assert!(matches!(
            r,
            Err(CacheError::Compute(AggregateError::Exhausted { attempted: 2, .. }))
        ));
    }
    assert!(kv.is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandoned_caller_does_not_cancel_compute() {
    let (cache, _kv) = cache_with_slow_ttl(600);
    let sig = CacheSignature::new("technology", None);
    let computes = Arc::new(AtomicUsize::new(0));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        cache.get_or_compute(&sig, counting(&computes, Duration::from_millis(100))),
    )
    .await;
    assert!(abandoned.is_err(), "caller gave up early");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = cache
        .get_or_compute(&sig, counting(&computes, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(later.status, CacheStatus::Hit);
    assert_eq!(computes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_compute_is_reported_as_aborted() {
    let (cache, _kv) = cache_with_slow_ttl(600);
    let sig = CacheSignature::new("technology", None);

    let res = cache
        .get_or_compute(&sig, || async {
            if sig_is_poisoned() {
                panic!("compute blew up");
            }
            Ok::<_, AggregateError>(batch("unreachable"))
        })
        .await;
    assert!(matches!(res, Err(CacheError::ComputeAborted)));
    assert_eq!(cache.inflight_len(), 0);

    // The signature is usable again afterwards.
    let ok = cache
        .get_or_compute(&sig, || async { Ok::<_, AggregateError>(batch("fresh")) })
        .await
        .unwrap();
    assert_eq!(ok.status, CacheStatus::Miss);
}

fn sig_is_poisoned() -> bool {
    true
}

#[tokio::test]
async fn unreachable_backend_bypasses_the_cache() {
    let cfg = AppConfig::default();
    let cache = AdaptiveCache::new(&cfg, Arc::new(DownKv));
    let sig = CacheSignature::new("general", None);
    let computes = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let out = cache
            .get_or_compute(&sig, counting(&computes, Duration::ZERO))
            .await
            .expect("request still succeeds");
        assert_eq!(out.status, CacheStatus::Bypass);
    }
    assert_eq!(computes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_one_or_all() {
    let (cache, kv) = cache_with_slow_ttl(600);
    let tech = CacheSignature::new("technology", None);
    let chips = CacheSignature::new("technology", Some("chips"));
    cache.put(&tech, &batch("t")).await.expect("stored");
    cache.put(&chips, &batch("c")).await.expect("stored");
    assert_eq!(kv.len(), 2);

    cache.invalidate(Some(&chips)).await.unwrap();
    assert_eq!(kv.len(), 1);
    cache.invalidate(None).await.unwrap();
    assert!(kv.is_empty());
}

#[test]
fn finance_ttl_in_market_hours_never_exceeds_ttl_outside() {
    let cfg = AppConfig::default();
    let cache = AdaptiveCache::new(&cfg, Arc::new(MemoryKvStore::new()));
    let policy = cache.policy();

    let monday = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
    let mut inside = Vec::new();
    let mut outside = Vec::new();
    for day in 0..7 {
        let date = monday + chrono::Duration::days(day);
        for minute in (0..24 * 60).step_by(5) {
            let t = date.and_hms_opt(minute / 60, minute % 60, 0).unwrap();
            let ttl = policy.ttl_for_local("finance", t);
            let weekday = !matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
            let hhmm = (minute / 60) * 100 + minute % 60;
            if weekday && (915..1530).contains(&hhmm) {
                inside.push(ttl);
            } else {
                outside.push(ttl);
            }
        }
    }
    let max_inside = inside.iter().max().unwrap();
    let min_outside = outside.iter().min().unwrap();
    assert!(max_inside <= min_outside);
}
