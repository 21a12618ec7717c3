// src/providers/gnews.rs
//! gnews.io v4 (`top-headlines` / `search`).

use serde::Deserialize;

use super::{normalize_opt, parse_rfc3339, strip_truncation, url_id, FetchRequest, NormalizeCtx};
use crate::config::ProviderConfig;
use crate::model::{Article, Lane};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    articles: Vec<Item>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    url: Option<String>,
    image: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    #[serde(default)]
    source: Option<Source>,
}

#[derive(Debug, Deserialize)]
struct Source {
    name: Option<String>,
}

fn topic_param(category: &str, lane: Lane) -> &'static str {
    match category {
        "business" | "finance" => "business",
        "sports" => "sports",
        "technology" => "technology",
        "health" => "health",
        "science" => "science",
        "entertainment" => "entertainment",
        "politics" => "nation",
        _ if lane == Lane::Global => "world",
        _ => "general",
    }
}

pub(crate) fn query(cfg: &ProviderConfig, req: &FetchRequest) -> Vec<(String, String)> {
    let mut q = vec![
        ("apikey".to_string(), cfg.api_key.clone()),
        ("max".to_string(), req.page_size.clamp(1, 100).to_string()),
    ];
    if let Some(lang) = &cfg.language {
        q.push(("lang".to_string(), lang.clone()));
    }
    if req.lane == Lane::Domestic {
        if let Some(c) = &cfg.domestic_country {
            q.push(("country".to_string(), c.clone()));
        }
    }
    match &req.query {
        Some(text) => {
            q.push(("q".to_string(), text.clone()));
            q.push(("sortby".to_string(), "publishedAt".to_string()));
        }
        None => q.push((
            "category".to_string(),
            topic_param(&req.category, req.lane).to_string(),
        )),
    }
    q
}

pub(crate) fn parse(body: &str, ctx: &NormalizeCtx<'_>) -> Result<Vec<Article>, String> {
    let env: Envelope = serde_json::from_str(body).map_err(|e| e.to_string())?;
    if let Some(errors) = env.errors {
        return Err(format!("provider errors: {errors}"));
    }

    let mut out = Vec::with_capacity(env.articles.len());
    for it in env.articles {
        let (Some(title), Some(url)) = (normalize_opt(it.title.as_deref()), it.url) else {
            continue;
        };
        let external_id = it
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| url_id(&url));
        out.push(ctx.article(
            external_id,
            title,
            url,
            normalize_opt(it.description.as_deref()),
            normalize_opt(it.content.as_deref()).map(strip_truncation),
            it.image.filter(|s| !s.is_empty()),
            it.source.and_then(|s| s.name),
            None,
            parse_rfc3339(it.published_at.as_deref()),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::Utc;

    fn parts(lane: Lane, query: Option<&str>) -> (ProviderConfig, FetchRequest) {
        let cfg = AppConfig::default()
            .providers
            .into_iter()
            .find(|p| p.id == "gnews")
            .unwrap();
        let req = FetchRequest {
            category: "general".into(),
            query: query.map(str::to_string),
            lane,
            page_size: 10,
        };
        (cfg, req)
    }

    #[test]
    fn global_lane_uses_world_topic_without_country() {
        let (cfg, req) = parts(Lane::Global, None);
        let q = query(&cfg, &req);
        assert!(q.contains(&("category".into(), "world".into())));
        assert!(!q.iter().any(|(k, _)| k == "country"));
    }

    #[test]
    fn search_sends_query_text() {
        let (cfg, req) = parts(Lane::Domestic, Some("monsoon"));
        let q = query(&cfg, &req);
        assert!(q.contains(&("q".into(), "monsoon".into())));
        assert!(q.contains(&("country".into(), "in".into())));
    }

    #[test]
    fn parses_minimal_items_and_missing_dates() {
        let (cfg, req) = parts(Lane::Global, None);
        let fetched_at = Utc::now();
        let ctx = NormalizeCtx {
            provider: &cfg,
            request: &req,
            fetched_at,
        };
        let body = r#"{"totalArticles": 2, "articles": [
            {"title": "Storm hits coast", "url": "https://g/1", "source": {"name": "Wire"}},
            {"title": "   ", "url": "https://g/2"}
        ]}"#;
        let out = parse(body, &ctx).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].published_at, fetched_at);
        assert_eq!(out[0].source_name.as_deref(), Some("Wire"));
        assert!(out[0].countries.is_empty());
    }

    #[test]
    fn errors_field_is_rejected() {
        let (cfg, req) = parts(Lane::Global, None);
        let ctx = NormalizeCtx {
            provider: &cfg,
            request: &req,
            fetched_at: Utc::now(),
        };
        assert!(parse(r#"{"errors": ["invalid api key"]}"#, &ctx).is_err());
    }
}
