// tests/common/mod.rs
//
// Shared fixtures for integration tests: a scripted in-memory transport,
// provider configs pointing at fake URLs, and canned newsapi-shaped bodies.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use newsdesk::cache::store::{KvStore, MemoryKvStore};
use newsdesk::config::{
    AppConfig, EndpointConfig, EndpointKind, ProviderConfig, ProviderKind, RetryPolicy,
};
use newsdesk::error::KvError;
use newsdesk::model::Article;
use newsdesk::providers::{HttpReply, Transport, TransportError};
use newsdesk::quota::store::MemoryCounterStore;
use newsdesk::store::MemoryArticleStore;
use newsdesk::{Collaborators, Core, DedupEngine};

pub type Scripted = Result<HttpReply, TransportError>;

/// Replies per URL. The last scripted reply repeats once the queue drains.
#[derive(Default)]
pub struct FakeTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script(&self, url: &str, replies: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into_iter().collect());
    }

    pub fn ok(&self, url: &str, body: String) {
        self.script(url, vec![Ok(HttpReply { status: 200, body })]);
    }

    pub fn status(&self, url: &str, status: u16) {
        self.script(
            url,
            vec![Ok(HttpReply {
                status,
                body: "{}".to_string(),
            })],
        );
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str, _query: &[(String, String)]) -> Result<HttpReply, TransportError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(url) else {
            return Err(TransportError::Connect(format!("no route to {url}")));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Connect("empty script".into())))
        }
    }
}

/// KV backend that is always down.
pub struct DownKv;

#[async_trait]
impl KvStore for DownKv {
    async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _key: &str) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn clear(&self) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
}

pub fn url_for(id: &str) -> String {
    format!("https://{id}.test/headlines")
}

/// newsapi-shaped provider at a fake URL, no retries, no backoff.
pub fn provider(id: &str, priority: u32, daily_cap: u32) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        kind: ProviderKind::NewsApi,
        priority,
        daily_cap,
        hourly_cap: None,
        endpoints: vec![EndpointConfig {
            kind: EndpointKind::Headlines,
            url: url_for(id),
        }],
        domestic_share: 0.75,
        retry: RetryPolicy {
            max_attempts: 1,
            backoff_secs: 0,
        },
        api_key_env: None,
        api_key: "test-key".to_string(),
        reset_hour: 0,
        cooldown_secs: 900,
        domestic_country: None,
        language: None,
    }
}

pub fn config(providers: Vec<ProviderConfig>) -> AppConfig {
    let mut cfg = AppConfig {
        providers,
        ..AppConfig::default()
    };
    cfg.quota.counter_path = None;
    cfg.scheduler.enabled = false;
    cfg
}

/// (title, minutes after 2025-03-10T08:00:00Z)
pub fn newsapi_body(prefix: &str, items: &[(&str, i64)]) -> String {
    let base = chrono::DateTime::parse_from_rfc3339("2025-03-10T08:00:00Z").unwrap();
    let articles: Vec<_> = items
        .iter()
        .enumerate()
        .map(|(i, (title, minute))| {
            json!({
                "source": { "id": null, "name": prefix },
                "author": null,
                "title": title,
                "description": format!("{title} (summary)"),
                "url": format!("https://{prefix}.example/{i}"),
                "urlToImage": null,
                "publishedAt": (base + chrono::Duration::minutes(*minute)).to_rfc3339(),
                "content": null
            })
        })
        .collect();
    json!({ "status": "ok", "totalResults": articles.len(), "articles": articles }).to_string()
}

pub struct Harness {
    pub core: Arc<Core>,
    pub transport: Arc<FakeTransport>,
    pub kv: Arc<MemoryKvStore>,
}

pub fn harness(cfg: AppConfig, transport: FakeTransport) -> Harness {
    let transport = Arc::new(transport);
    let kv = Arc::new(MemoryKvStore::new());
    let articles = MemoryArticleStore::with_dedup(DedupEngine::new(&cfg.dedup));
    let core = Core::new(
        cfg,
        Collaborators {
            transport: transport.clone(),
            counters: Arc::new(MemoryCounterStore::new()),
            kv: kv.clone(),
            articles: Arc::new(articles),
        },
    );
    Harness {
        core,
        transport,
        kv,
    }
}

/// Bare article published `minute` minutes after 2025-03-10T08:00:00Z.
pub fn article(provider: &str, id: &str, priority: u32, title: &str, minute: i64) -> Article {
    let base = chrono::DateTime::parse_from_rfc3339("2025-03-10T08:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    Article {
        provider: provider.to_string(),
        external_id: id.to_string(),
        provider_priority: priority,
        title: title.to_string(),
        description: None,
        body: None,
        url: format!("https://{provider}.example/{id}"),
        image_url: None,
        source_name: None,
        author: None,
        category: "general".to_string(),
        published_at: base + chrono::Duration::minutes(minute),
        fetched_at: base,
        countries: vec![],
        domestic: false,
        relevance: None,
        sentiment: None,
        tags: vec![],
        fingerprint: None,
    }
}
