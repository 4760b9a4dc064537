//! News article collector.
//!
//! Speaks a conventional article-search API: one query per window covering
//! all cohort symbols, paginated, bearer-authenticated. Outlet reputation
//! drives the author weight.

use crate::pipeline::collectors::{
    finalize_batch, CollectBatch, CollectError, CollectWindow, Collector, CycleContext,
};
use crate::pipeline::rate_limit::SourceRateLimiter;
use crate::secrets::CredentialStore;
use crate::types::{Item, SourceKind, DEFAULT_AUTHOR_WEIGHT};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Wire format of the article search endpoint.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    articles: Vec<Article>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Article {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    source_name: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    author: Option<String>,
}

/// Reputation table for known outlets; unknown outlets get the default.
fn outlet_weight(source_name: &str) -> f64 {
    match source_name.to_lowercase().as_str() {
        "reuters" | "bloomberg" | "associated press" => 0.9,
        "coindesk" | "the block" | "cointelegraph" => 0.7,
        name if name.contains("blog") => 0.3,
        _ => DEFAULT_AUTHOR_WEIGHT,
    }
}

pub struct NewsCollector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    rate_limiter: Arc<SourceRateLimiter>,
    max_items: usize,
}

impl NewsCollector {
    pub fn new(
        name: String,
        client: reqwest::Client,
        base_url: String,
        credentials: Arc<CredentialStore>,
        rate_limiter: Arc<SourceRateLimiter>,
        max_items: usize,
    ) -> Self {
        Self {
            name,
            client,
            base_url,
            credentials,
            rate_limiter,
            max_items,
        }
    }

    async fn fetch_page(
        &self,
        window: CollectWindow,
        query: &str,
        page: Option<&str>,
    ) -> Result<SearchResponse, CollectError> {
        let token = self
            .credentials
            .get(&self.name)
            .await
            .ok_or_else(|| CollectError::Terminal(format!("no credential for {}", self.name)))?;

        let from = Utc.timestamp_opt(window.start_ts, 0).unwrap().to_rfc3339();
        let to = Utc.timestamp_opt(window.end_ts, 0).unwrap().to_rfc3339();
        let mut request = self
            .client
            .get(format!("{}/v2/everything", self.base_url))
            .bearer_auth(token)
            .query(&[("q", query), ("from", &from), ("to", &to)]);
        if let Some(page) = page {
            request = request.query(&[("page", page)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CollectError::from_status(response.status(), &self.name));
        }
        response
            .json::<SearchResponse>()
            .await
            .map_err(|e| CollectError::Terminal(format!("malformed article payload: {}", e)))
    }

    fn to_item(article: Article, assets: &[String]) -> Option<Item> {
        let text = match &article.description {
            Some(description) => format!("{}. {}", article.title, description),
            None => article.title.clone(),
        };
        let haystack = text.to_lowercase();
        let tags: Vec<String> = assets
            .iter()
            .filter(|symbol| haystack.contains(&symbol.to_lowercase()))
            .cloned()
            .collect();
        if tags.is_empty() {
            return None;
        }
        Some(Item::new(
            format!("news:{}", article.id),
            SourceKind::News,
            text,
            article.author.unwrap_or_else(|| article.source_name.clone()),
            outlet_weight(&article.source_name),
            article.published_at.timestamp(),
            tags,
        ))
    }
}

#[async_trait]
impl Collector for NewsCollector {
    fn source(&self) -> SourceKind {
        SourceKind::News
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, ctx, assets), fields(source = %self.name))]
    async fn collect(
        &self,
        ctx: &CycleContext,
        window: CollectWindow,
        assets: &[String],
    ) -> Result<CollectBatch, CollectError> {
        let query = assets.join(" OR ");
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            if !self.rate_limiter.acquire_until(ctx.deadline).await {
                return Err(CollectError::Cancelled);
            }

            let page = self.fetch_page(window, &query, cursor.as_deref()).await?;
            for article in page.articles {
                if !window.contains(article.published_at.timestamp()) {
                    continue;
                }
                if let Some(item) = Self::to_item(article, assets) {
                    items.push(item);
                }
            }

            cursor = page.next_page;
            if cursor.is_none() || items.len() >= self.max_items || ctx.expired() {
                break;
            }
        }

        debug!("news collector fetched {} articles", items.len());
        Ok(CollectBatch {
            items: finalize_batch(items, self.max_items),
            next_cursor: cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlet_weights() {
        assert_eq!(outlet_weight("Reuters"), 0.9);
        assert_eq!(outlet_weight("CoinDesk"), 0.7);
        assert_eq!(outlet_weight("randomcryptoblog"), 0.3);
        assert_eq!(outlet_weight("Daily Gazette"), DEFAULT_AUTHOR_WEIGHT);
    }

    #[test]
    fn test_to_item_tags_by_symbol_mention() {
        let article = Article {
            id: "a1".to_string(),
            title: "WETH rallies on upgrade news".to_string(),
            description: Some("Analysts expect more gains".to_string()),
            source_name: "Reuters".to_string(),
            published_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author: Some("jdoe".to_string()),
        };
        let assets = vec!["WETH".to_string(), "WBTC".to_string()];
        let item = NewsCollector::to_item(article, &assets).unwrap();
        assert_eq!(item.id, "news:a1");
        assert_eq!(item.asset_tags, vec!["WETH".to_string()]);
        assert_eq!(item.author_weight, 0.9);
        assert_eq!(item.created_at, 1_700_000_000);
    }

    #[test]
    fn test_to_item_drops_untagged() {
        let article = Article {
            id: "a2".to_string(),
            title: "Unrelated market commentary".to_string(),
            description: None,
            source_name: "Reuters".to_string(),
            published_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author: None,
        };
        assert!(NewsCollector::to_item(article, &["WETH".to_string()]).is_none());
    }

    #[test]
    fn test_search_response_parses() {
        let raw = r#"{
            "articles": [{
                "id": "x",
                "title": "t",
                "source_name": "Reuters",
                "published_at": "2023-11-14T22:13:20Z"
            }],
            "next_page": "2"
        }"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.articles.len(), 1);
        assert_eq!(parsed.next_page.as_deref(), Some("2"));
    }
}
