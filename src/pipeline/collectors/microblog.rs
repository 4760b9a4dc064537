//! Microblog (short-post) collector.
//!
//! One cashtag search per symbol per window, paginated with the source's
//! opaque token. Author weight comes from follower count and account age.

use crate::pipeline::collectors::{
    finalize_batch, CollectBatch, CollectError, CollectWindow, Collector, CycleContext,
};
use crate::pipeline::rate_limit::SourceRateLimiter;
use crate::secrets::CredentialStore;
use crate::types::{Item, SourceKind, DEFAULT_AUTHOR_WEIGHT};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Page size requested from the search endpoint.
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Post>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    text: String,
    author_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    #[serde(default)]
    followers_count: u64,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    next_token: Option<String>,
}

/// Follower count and account age folded into [0,1]. New accounts with no
/// reach sit near zero; established accounts approach one.
fn author_weight(user: Option<&User>, now_ts: i64) -> f64 {
    let Some(user) = user else {
        return DEFAULT_AUTHOR_WEIGHT;
    };
    let reach = ((user.followers_count as f64 + 1.0).log10() / 6.0).clamp(0.0, 1.0);
    let age = match user.created_at {
        Some(created) => {
            let days = ((now_ts - created.timestamp()) as f64 / 86_400.0).max(0.0);
            (days / 365.0).clamp(0.0, 1.0)
        }
        None => 0.5,
    };
    (0.6 * reach + 0.4 * age).clamp(0.0, 1.0)
}

pub struct MicroblogCollector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    rate_limiter: Arc<SourceRateLimiter>,
    max_items: usize,
}

impl MicroblogCollector {
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
        symbol: &str,
        next_token: Option<&str>,
    ) -> Result<SearchResponse, CollectError> {
        let token = self
            .credentials
            .get(&self.name)
            .await
            .ok_or_else(|| CollectError::Terminal(format!("no credential for {}", self.name)))?;

        let start = Utc.timestamp_opt(window.start_ts, 0).unwrap().to_rfc3339();
        let end = Utc.timestamp_opt(window.end_ts, 0).unwrap().to_rfc3339();
        let query = format!("${} -is:repost", symbol);
        let max_results = PAGE_SIZE.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("query", &query),
            ("start_time", &start),
            ("end_time", &end),
            ("max_results", &max_results),
            ("user.fields", "followers_count,created_at"),
        ];
        if let Some(next) = next_token {
            params.push(("next_token", next));
        }

        let response = self
            .client
            .get(format!("{}/2/posts/search/recent", self.base_url))
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CollectError::from_status(response.status(), &self.name));
        }
        response
            .json::<SearchResponse>()
            .await
            .map_err(|e| CollectError::Terminal(format!("malformed search payload: {}", e)))
    }
}

#[async_trait]
impl Collector for MicroblogCollector {
    fn source(&self) -> SourceKind {
        SourceKind::Microblog
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
        let mut items = Vec::new();
        let mut last_cursor = None;

        'symbols: for symbol in assets {
            let mut next_token: Option<String> = None;
            loop {
                if !self.rate_limiter.acquire_until(ctx.deadline).await {
                    return Err(CollectError::Cancelled);
                }

                let page = self
                    .fetch_page(window, symbol, next_token.as_deref())
                    .await?;
                let users: HashMap<&str, &User> = page
                    .includes
                    .as_ref()
                    .map(|includes| {
                        includes
                            .users
                            .iter()
                            .map(|user| (user.id.as_str(), user))
                            .collect()
                    })
                    .unwrap_or_default();

                for post in &page.data {
                    let created_at = post.created_at.timestamp();
                    if !window.contains(created_at) {
                        continue;
                    }
                    let weight =
                        author_weight(users.get(post.author_id.as_str()).copied(), window.end_ts);
                    items.push(Item::new(
                        format!("microblog:{}", post.id),
                        SourceKind::Microblog,
                        post.text.clone(),
                        post.author_id.clone(),
                        weight,
                        created_at,
                        vec![symbol.clone()],
                    ));
                }

                next_token = page.meta.and_then(|meta| meta.next_token);
                if items.len() >= self.max_items {
                    last_cursor = next_token;
                    break 'symbols;
                }
                if next_token.is_none() || ctx.expired() {
                    break;
                }
            }
        }

        debug!("microblog collector fetched {} posts", items.len());
        Ok(CollectBatch {
            items: finalize_batch(items, self.max_items),
            next_cursor: last_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_weight_unknown_user_is_default() {
        assert_eq!(author_weight(None, 0), DEFAULT_AUTHOR_WEIGHT);
    }

    #[test]
    fn test_author_weight_fresh_account_low() {
        let now = 1_700_000_000;
        let user = User {
            id: "u".to_string(),
            followers_count: 3,
            created_at: Some(Utc.timestamp_opt(now - 86_400, 0).unwrap()),
        };
        let weight = author_weight(Some(&user), now);
        assert!(weight < 0.2, "weight was {}", weight);
    }

    #[test]
    fn test_author_weight_established_account_high() {
        let now = 1_700_000_000;
        let user = User {
            id: "u".to_string(),
            followers_count: 2_000_000,
            created_at: Some(Utc.timestamp_opt(now - 5 * 365 * 86_400, 0).unwrap()),
        };
        let weight = author_weight(Some(&user), now);
        assert!(weight > 0.9, "weight was {}", weight);
    }

    #[test]
    fn test_author_weight_bounded() {
        let user = User {
            id: "u".to_string(),
            followers_count: u64::MAX,
            created_at: Some(Utc.timestamp_opt(0, 0).unwrap()),
        };
        let weight = author_weight(Some(&user), i64::MAX / 2);
        assert!(weight <= 1.0);
    }

    #[test]
    fn test_search_response_parses_without_optionals() {
        let raw = r#"{"data": [{"id": "1", "text": "hello", "author_id": "u9",
                      "created_at": "2023-11-14T22:13:20Z"}]}"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert!(parsed.includes.is_none());
        assert!(parsed.meta.is_none());
    }
}
