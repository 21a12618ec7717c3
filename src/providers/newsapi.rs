// src/providers/newsapi.rs
//! newsapi.org v2 (`top-headlines` / `everything`).

use serde::Deserialize;

use super::{normalize_opt, parse_rfc3339, strip_truncation, url_id, FetchRequest, NormalizeCtx};
use crate::config::ProviderConfig;
use crate::model::{Article, Lane};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    source: Option<Source>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    #[serde(rename = "urlToImage")]
    url_to_image: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Source {
    name: Option<String>,
}

fn category_param(category: &str) -> &'static str {
    match category {
        "business" | "finance" => "business",
        "sports" => "sports",
        "technology" => "technology",
        "health" => "health",
        "science" => "science",
        "entertainment" => "entertainment",
        _ => "general",
    }
}

pub(crate) fn query(cfg: &ProviderConfig, req: &FetchRequest) -> Vec<(String, String)> {
    let mut q = vec![
        ("apiKey".to_string(), cfg.api_key.clone()),
        ("pageSize".to_string(), req.page_size.clamp(1, 100).to_string()),
    ];
    match &req.query {
        Some(text) => {
            q.push(("q".to_string(), text.clone()));
            q.push(("sortBy".to_string(), "publishedAt".to_string()));
            if let Some(lang) = &cfg.language {
                q.push(("language".to_string(), lang.clone()));
            }
        }
        None => {
            q.push(("category".to_string(), category_param(&req.category).to_string()));
            if req.lane == Lane::Domestic {
                if let Some(c) = &cfg.domestic_country {
                    q.push(("country".to_string(), c.clone()));
                }
            } else if let Some(lang) = &cfg.language {
                q.push(("language".to_string(), lang.clone()));
            }
        }
    }
    q
}

pub(crate) fn parse(body: &str, ctx: &NormalizeCtx<'_>) -> Result<Vec<Article>, String> {
    let env: Envelope = serde_json::from_str(body).map_err(|e| e.to_string())?;
    if env.status.as_deref() == Some("error") {
        return Err(format!(
            "{}: {}",
            env.code.unwrap_or_default(),
            env.message.unwrap_or_default()
        ));
    }

    let mut out = Vec::with_capacity(env.articles.len());
    for it in env.articles {
        let (Some(title), Some(url)) = (normalize_opt(it.title.as_deref()), it.url) else {
            continue;
        };
        // Withdrawn items come back as "[Removed]".
        if title == "[Removed]" {
            continue;
        }
        let mut a = ctx.article(
            url_id(&url),
            title,
            url,
            normalize_opt(it.description.as_deref()),
            normalize_opt(it.content.as_deref()).map(strip_truncation),
            it.url_to_image.filter(|s| !s.is_empty()),
            it.source.and_then(|s| s.name),
            normalize_opt(it.author.as_deref()),
            parse_rfc3339(it.published_at.as_deref()),
        );
        a.body = a.body.filter(|b| !b.is_empty());
        out.push(a);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::Utc;

    fn ctx_parts() -> (ProviderConfig, FetchRequest) {
        let mut cfg = AppConfig::default()
            .providers
            .into_iter()
            .find(|p| p.id == "newsapi")
            .unwrap();
        cfg.api_key = "k".into();
        let req = FetchRequest {
            category: "finance".into(),
            query: None,
            lane: Lane::Domestic,
            page_size: 20,
        };
        (cfg, req)
    }

    #[test]
    fn headlines_query_maps_category_and_country() {
        let (cfg, req) = ctx_parts();
        let q = query(&cfg, &req);
        assert!(q.contains(&("category".into(), "business".into())));
        assert!(q.contains(&("country".into(), "in".into())));
        assert!(q.contains(&("apiKey".into(), "k".into())));
    }

    #[test]
    fn parses_and_skips_incomplete_items() {
        let (cfg, req) = ctx_parts();
        let ctx = NormalizeCtx {
            provider: &cfg,
            request: &req,
            fetched_at: Utc::now(),
        };
        let body = r#"{
          "status": "ok", "totalResults": 3,
          "articles": [
            {"source": {"id": null, "name": "Mint"}, "author": "A. Writer",
             "title": "RBI holds repo rate", "description": "<p>Policy unchanged</p>",
             "url": "https://mint.example/rbi", "urlToImage": "https://img/rbi.jpg",
             "publishedAt": "2025-03-10T08:00:00Z", "content": "The RBI kept… [+1200 chars]"},
            {"source": {"name": "X"}, "title": null, "url": "https://x/1"},
            {"title": "[Removed]", "url": "https://removed.example"}
          ]
        }"#;
        let out = parse(body, &ctx).unwrap();
        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert_eq!(a.title, "RBI holds repo rate");
        assert_eq!(a.description.as_deref(), Some("Policy unchanged"));
        assert_eq!(a.body.as_deref(), Some("The RBI kept"));
        assert_eq!(a.source_name.as_deref(), Some("Mint"));
        assert_eq!(a.category, "finance");
        assert_eq!(a.countries, vec!["in".to_string()]);
    }

    #[test]
    fn error_envelope_is_rejected() {
        let (cfg, req) = ctx_parts();
        let ctx = NormalizeCtx {
            provider: &cfg,
            request: &req,
            fetched_at: Utc::now(),
        };
        let body = r#"{"status":"error","code":"apiKeyInvalid","message":"bad key"}"#;
        assert!(parse(body, &ctx).unwrap_err().contains("apiKeyInvalid"));
    }
}
