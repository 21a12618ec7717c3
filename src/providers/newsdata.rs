// src/providers/newsdata.rs
//! newsdata.io (`/api/1/latest`). Dates are `YYYY-MM-DD HH:MM:SS` UTC and
//! country metadata is reported per article.

use serde::Deserialize;
use serde_json::Value;

use super::{normalize_opt, parse_sql_utc, FetchRequest, NormalizeCtx};
use crate::config::ProviderConfig;
use crate::model::{Article, Lane};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    /// An array on success, an error object otherwise.
    #[serde(default)]
    results: Value,
}

#[derive(Debug, Deserialize)]
struct Item {
    article_id: Option<String>,
    title: Option<String>,
    link: Option<String>,
    #[serde(default)]
    keywords: Option<Vec<String>>,
    #[serde(default)]
    creator: Option<Vec<String>>,
    description: Option<String>,
    content: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    image_url: Option<String>,
    source_id: Option<String>,
    #[serde(default)]
    source_name: Option<String>,
    #[serde(default)]
    country: Option<Vec<String>>,
}

fn category_param(category: &str) -> &'static str {
    match category {
        "business" | "finance" => "business",
        "sports" => "sports",
        "technology" => "technology",
        "health" => "health",
        "science" => "science",
        "politics" => "politics",
        "entertainment" => "entertainment",
        _ => "top",
    }
}

pub(crate) fn query(cfg: &ProviderConfig, req: &FetchRequest) -> Vec<(String, String)> {
    let mut q = vec![
        ("apikey".to_string(), cfg.api_key.clone()),
        ("size".to_string(), req.page_size.clamp(1, 50).to_string()),
    ];
    if let Some(lang) = &cfg.language {
        q.push(("language".to_string(), lang.clone()));
    }
    if req.lane == Lane::Domestic {
        if let Some(c) = &cfg.domestic_country {
            q.push(("country".to_string(), c.clone()));
        }
    }
    match &req.query {
        Some(text) => q.push(("q".to_string(), text.clone())),
        None => q.push((
            "category".to_string(),
            category_param(&req.category).to_string(),
        )),
    }
    q
}

pub(crate) fn parse(body: &str, ctx: &NormalizeCtx<'_>) -> Result<Vec<Article>, String> {
    let env: Envelope = serde_json::from_str(body).map_err(|e| e.to_string())?;
    if env.status.as_deref() == Some("error") {
        let msg = env
            .results
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(msg.to_string());
    }
    let items: Vec<Item> = match env.results {
        Value::Null => Vec::new(),
        v => serde_json::from_value(v).map_err(|e| e.to_string())?,
    };

    let mut out = Vec::with_capacity(items.len());
    for it in items {
        let (Some(title), Some(url)) = (normalize_opt(it.title.as_deref()), it.link) else {
            continue;
        };
        let Some(external_id) = it.article_id.filter(|s| !s.is_empty()) else {
            continue;
        };
        let mut a = ctx.article(
            external_id,
            title,
            url,
            normalize_opt(it.description.as_deref()),
            // Free plans return a placeholder instead of the body.
            normalize_opt(it.content.as_deref()).filter(|c| !c.starts_with("ONLY AVAILABLE IN")),
            it.image_url.filter(|s| !s.is_empty()),
            it.source_name.or(it.source_id),
            it.creator.and_then(|c| c.into_iter().next()),
            parse_sql_utc(it.pub_date.as_deref()),
        );
        if let Some(countries) = it.country {
            a.countries = countries.into_iter().map(|c| c.to_ascii_lowercase()).collect();
        }
        a.tags = it
            .keywords
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        out.push(a);
    }
    Ok(out)
}
