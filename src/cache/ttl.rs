// src/cache/ttl.rs
//! Freshness policy: TTL by category and by the local event window.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Utc, Weekday};
use std::time::Duration;

use crate::config::{CacheConfig, EventWindows, TtlConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CategoryClass {
    Breaking,
    Sports,
    Markets,
    Civic,
    SlowMoving,
    Other,
}

fn class_of(category: &str) -> CategoryClass {
    match category.trim().to_ascii_lowercase().as_str() {
        "breaking" | "top" => CategoryClass::Breaking,
        "sports" | "cricket" => CategoryClass::Sports,
        "finance" | "business" | "markets" | "economy" => CategoryClass::Markets,
        "politics" | "general" | "nation" | "world" => CategoryClass::Civic,
        "technology" | "tech" | "health" | "science" => CategoryClass::SlowMoving,
        _ => CategoryClass::Other,
    }
}

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    ttl: TtlConfig,
    windows: EventWindows,
    offset: FixedOffset,
}

impl TtlPolicy {
    pub fn new(cfg: &CacheConfig, offset: FixedOffset) -> Self {
        Self {
            ttl: cfg.ttl.clone(),
            windows: cfg.windows.clone(),
            offset,
        }
    }

    pub fn ttl_for(&self, category: &str, now: DateTime<Utc>) -> Duration {
        self.ttl_for_local(category, now.with_timezone(&self.offset).naive_local())
    }

    pub fn ttl_for_local(&self, category: &str, local: NaiveDateTime) -> Duration {
        let t = local.time();
        let secs = match class_of(category) {
            CategoryClass::Breaking => self.ttl.breaking,
            CategoryClass::Sports => {
                if self.windows.sports.contains(t) {
                    self.ttl.sports_live
                } else {
                    self.ttl.sports_idle
                }
            }
            CategoryClass::Markets => {
                let trading_day = !self.windows.market_weekdays_only
                    || !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
                if trading_day && self.windows.market.contains(t) {
                    self.ttl.finance_open
                } else {
                    self.ttl.finance_closed
                }
            }
            CategoryClass::Civic => {
                if self.windows.business.contains(t) {
                    self.ttl.business_hours
                } else {
                    self.ttl.off_hours
                }
            }
            CategoryClass::SlowMoving => self.ttl.slow_moving,
            CategoryClass::Other => self.ttl.default,
        };
        Duration::from_secs(secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn policy() -> TtlPolicy {
        TtlPolicy::new(&CacheConfig::default(), FixedOffset::east_opt(0).unwrap())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn finance_is_short_only_in_weekday_market_hours() {
        let p = policy();
        // 2025-03-10 is a Monday, 2025-03-15 a Saturday.
        assert_eq!(p.ttl_for_local("finance", at(2025, 3, 10, 10, 0)), Duration::from_secs(300));
        assert_eq!(p.ttl_for_local("finance", at(2025, 3, 10, 16, 0)), Duration::from_secs(1800));
        assert_eq!(p.ttl_for_local("business", at(2025, 3, 15, 10, 0)), Duration::from_secs(1800));
    }

    #[test]
    fn sports_is_short_in_the_evening_window() {
        let p = policy();
        assert_eq!(p.ttl_for_local("sports", at(2025, 3, 10, 20, 0)), Duration::from_secs(180));
        assert_eq!(p.ttl_for_local("sports", at(2025, 3, 10, 9, 0)), Duration::from_secs(1800));
    }

    #[test]
    fn fixed_classes() {
        let p = policy();
        let t = at(2025, 3, 10, 12, 0);
        assert_eq!(p.ttl_for_local("breaking", t), Duration::from_secs(120));
        assert_eq!(p.ttl_for_local("Technology", t), Duration::from_secs(3600));
        assert_eq!(p.ttl_for_local("gardening", t), Duration::from_secs(900));
        assert_eq!(p.ttl_for_local("politics", t), Duration::from_secs(600));
        assert_eq!(p.ttl_for_local("politics", at(2025, 3, 10, 22, 0)), Duration::from_secs(1800));
    }

    #[test]
    fn offset_shifts_into_local_time() {
        let p = TtlPolicy::new(&CacheConfig::default(), FixedOffset::east_opt(330 * 60).unwrap());
        // 05:00 UTC is 10:30 IST on a Monday.
        let now = at(2025, 3, 10, 5, 0).and_utc();
        assert_eq!(p.ttl_for("finance", now), Duration::from_secs(300));
    }
}
