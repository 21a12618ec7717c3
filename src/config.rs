// src/config.rs
//! Immutable service configuration.
//!
//! Loaded once at startup from TOML and then shared as `Arc<AppConfig>`;
//! no component reads ambient configuration after construction.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/newsdesk.toml";
pub const ENV_CONFIG_PATH: &str = "NEWSDESK_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub market: MarketConfig,
    pub quota: QuotaConfig,
    pub dedup: DedupConfig,
    pub cache: CacheConfig,
    pub split: SplitConfig,
    pub aggregate: AggregateConfig,
    pub scheduler: SchedulerConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            market: MarketConfig::default(),
            quota: QuotaConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            split: SplitConfig::default(),
            aggregate: AggregateConfig::default(),
            scheduler: SchedulerConfig::default(),
            providers: default_providers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Upper bound for draining in-flight work on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 10,
            connect_timeout_secs: 4,
            user_agent: "newsdesk/0.1".to_string(),
            shutdown_grace_secs: 15,
        }
    }
}

/// Local time of the content market. Event windows and quota days are
/// evaluated in this offset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub utc_offset_minutes: i32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
        }
    }
}

impl MarketConfig {
    /// `None` when the configured minutes do not form a valid offset.
    pub fn checked_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    pub fn offset(&self) -> FixedOffset {
        self.checked_offset().unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    /// JSON file for durable counters; `None` keeps counters in memory only.
    pub counter_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
    pub reset_retry_attempts: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warning_ratio: 0.85,
            critical_ratio: 0.95,
            counter_path: Some(PathBuf::from("cache/quota_counters.json")),
            flush_interval_secs: 30,
            reset_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub threshold: f64,
    pub window_secs: i64,
    /// Pairs scoring within this margin below the threshold are counted as
    /// ambiguous. They are always kept.
    pub ambiguity_margin: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            window_secs: 3600,
            ambiguity_margin: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub wait_timeout_secs: u64,
    /// How long past its TTL an entry may still be served while a refresh
    /// runs. 0 turns stale serving off.
    pub stale_secs: u64,
    pub ttl: TtlConfig,
    pub windows: EventWindows,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30,
            stale_secs: 1800,
            ttl: TtlConfig::default(),
            windows: EventWindows::default(),
        }
    }
}

/// TTL values in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub breaking: u64,
    pub sports_live: u64,
    pub sports_idle: u64,
    pub finance_open: u64,
    pub finance_closed: u64,
    pub business_hours: u64,
    pub off_hours: u64,
    pub slow_moving: u64,
    pub default: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            breaking: 120,
            sports_live: 180,
            sports_idle: 1800,
            finance_open: 300,
            finance_closed: 1800,
            business_hours: 600,
            off_hours: 1800,
            slow_moving: 3600,
            default: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventWindows {
    pub market: TimeWindow,
    pub market_weekdays_only: bool,
    pub business: TimeWindow,
    pub sports: TimeWindow,
}

impl Default for EventWindows {
    fn default() -> Self {
        Self {
            market: TimeWindow::hm((9, 15), (15, 30)),
            market_weekdays_only: true,
            business: TimeWindow::hm((9, 0), (18, 0)),
            sports: TimeWindow::hm((18, 0), (23, 30)),
        }
    }
}

/// Half-open `[start, end)` window of local wall-clock time. A window whose
/// end is before its start wraps past midnight.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeWindow {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl TimeWindow {
    fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: ClockTime::hm(start.0, start.1),
            end: ClockTime::hm(end.0, end.1),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        let (s, e) = (self.start.0, self.end.0);
        if s <= e {
            s <= t && t < e
        } else {
            t >= s || t < e
        }
    }
}

/// `"HH:MM"` wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ClockTime(pub NaiveTime);

impl ClockTime {
    fn hm(h: u32, m: u32) -> Self {
        Self(NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN))
    }
}

impl TryFrom<String> for ClockTime {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(ClockTime)
            .map_err(|e| format!("invalid HH:MM time '{s}': {e}"))
    }
}

/// What happens when one side of a provider's domestic/global request
/// share is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// The exhausted side may borrow from the other side's remaining share
    /// as long as the provider's total cap holds.
    #[default]
    Borrow,
    /// Each side is capped at its share of the daily cap.
    Strict,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Target fraction of served articles that are domestic.
    pub domestic_target: f64,
    pub policy: SplitPolicy,
    /// Lowercase ISO country codes treated as domestic in provider metadata.
    pub domestic_countries: Vec<String>,
    pub domestic_keywords: Vec<String>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            domestic_target: 0.75,
            policy: SplitPolicy::Borrow,
            domestic_countries: vec!["in".to_string(), "india".to_string()],
            domestic_keywords: [
                "india", "indian", "delhi", "mumbai", "bengaluru", "chennai", "kolkata",
                "hyderabad", "lok sabha", "rajya sabha", "rbi", "sensex", "nifty", "bcci",
                "isro",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub max_fanout: usize,
    pub default_target: usize,
    pub max_target: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_fanout: 2,
            default_target: 30,
            max_target: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub refresh_categories: Vec<String>,
    pub refresh_interval_secs: u64,
    pub rollover_check_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_categories: vec!["general".to_string(), "business".to_string()],
            refresh_interval_secs: 900,
            rollover_check_secs: 60,
        }
    }
}

/// Closed set of upstream response shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    NewsApi,
    GNews,
    NewsData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Headlines,
    Search,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    /// 1 = highest.
    pub priority: u32,
    pub daily_cap: u32,
    #[serde(default)]
    pub hourly_cap: Option<u32>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Share of this provider's daily cap reserved for domestic requests.
    #[serde(default = "default_domestic_share")]
    pub domestic_share: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Resolved from `api_key_env` at load time; never deserialized.
    #[serde(skip)]
    pub api_key: String,
    /// Local hour at which the provider's daily counter resets.
    #[serde(default)]
    pub reset_hour: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub domestic_country: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_domestic_share() -> f64 {
    0.75
}

fn default_cooldown_secs() -> u64 {
    900
}

impl ProviderConfig {
    pub fn endpoint(&self, kind: EndpointKind) -> Option<&EndpointConfig> {
        self.endpoints
            .iter()
            .find(|e| e.kind == kind)
            .or_else(|| self.endpoints.first())
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    let mk = |id: &str,
              kind: ProviderKind,
              priority: u32,
              daily_cap: u32,
              key_env: &str,
              headlines: &str,
              search: &str| ProviderConfig {
        id: id.to_string(),
        kind,
        priority,
        daily_cap,
        hourly_cap: None,
        endpoints: vec![
            EndpointConfig {
                kind: EndpointKind::Headlines,
                url: headlines.to_string(),
            },
            EndpointConfig {
                kind: EndpointKind::Search,
                url: search.to_string(),
            },
        ],
        domestic_share: default_domestic_share(),
        retry: RetryPolicy::default(),
        api_key_env: Some(key_env.to_string()),
        api_key: String::new(),
        reset_hour: 0,
        cooldown_secs: default_cooldown_secs(),
        domestic_country: Some("in".to_string()),
        language: Some("en".to_string()),
    };
    vec![
        mk(
            "newsdata",
            ProviderKind::NewsData,
            1,
            200,
            "NEWSDATA_API_KEY",
            "https://newsdata.io/api/1/latest",
            "https://newsdata.io/api/1/latest",
        ),
        mk(
            "gnews",
            ProviderKind::GNews,
            2,
            100,
            "GNEWS_API_KEY",
            "https://gnews.io/api/v4/top-headlines",
            "https://gnews.io/api/v4/search",
        ),
        mk(
            "newsapi",
            ProviderKind::NewsApi,
            3,
            100,
            "NEWSAPI_KEY",
            "https://newsapi.org/v2/top-headlines",
            "https://newsapi.org/v2/everything",
        ),
    ]
}

impl AppConfig {
    /// Parse TOML, resolve API keys from the environment, and validate.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s).context("parsing newsdesk config toml")?;
        cfg.resolve_api_keys();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("loading {}", path.display()))
    }

    /// Load using env var + fallbacks:
    /// 1) $NEWSDESK_CONFIG_PATH
    /// 2) config/newsdesk.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        let mut cfg = Self::default();
        cfg.resolve_api_keys();
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_api_keys(&mut self) {
        for p in &mut self.providers {
            if let Some(var) = &p.api_key_env {
                match std::env::var(var) {
                    Ok(k) => p.api_key = k.trim().to_string(),
                    Err(_) => {
                        tracing::warn!(target: "config", provider = %p.id, env = %var, "api key env var not set");
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("at least one provider must be configured");
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.as_str()) {
                bail!("duplicate provider id '{}'", p.id);
            }
            if p.priority == 0 {
                bail!("provider '{}': priority starts at 1", p.id);
            }
            if p.daily_cap == 0 {
                bail!("provider '{}': daily_cap must be > 0", p.id);
            }
            if p.hourly_cap == Some(0) {
                bail!("provider '{}': hourly_cap must be > 0 when set", p.id);
            }
            if !(0.0..=1.0).contains(&p.domestic_share) {
                bail!("provider '{}': domestic_share must be within 0..=1", p.id);
            }
            if p.reset_hour > 23 {
                bail!("provider '{}': reset_hour must be 0..=23", p.id);
            }
            if p.retry.max_attempts == 0 {
                bail!("provider '{}': retry.max_attempts must be >= 1", p.id);
            }
            if p.endpoints.is_empty() {
                bail!("provider '{}': no endpoints configured", p.id);
            }
        }
        if !(0.0..=1.0).contains(&self.dedup.threshold) {
            bail!("dedup.threshold must be within 0..=1");
        }
        if self.dedup.window_secs < 0 {
            bail!("dedup.window_secs must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.split.domestic_target) {
            bail!("split.domestic_target must be within 0..=1");
        }
        let q = &self.quota;
        if !(0.0 < q.warning_ratio && q.warning_ratio <= q.critical_ratio && q.critical_ratio <= 1.0)
        {
            bail!("quota thresholds must satisfy 0 < warning <= critical <= 1");
        }
        if self.aggregate.max_fanout == 0 {
            bail!("aggregate.max_fanout must be >= 1");
        }
        if self.market.checked_offset().is_none() {
            bail!("market.utc_offset_minutes out of range");
        }
        Ok(())
    }
}
