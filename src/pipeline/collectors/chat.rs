//! Chat room collector, covering the two room-service wire formats.
//!
//! Both services expose per-room message history over HTTP; they differ in
//! payload shape and in what passes for an author-quality signal. One
//! collector handles both behind the `ChatWire` switch.

use crate::pipeline::collectors::{
    finalize_batch, CollectBatch, CollectError, CollectWindow, Collector, CycleContext,
};
use crate::pipeline::rate_limit::SourceRateLimiter;
use crate::secrets::CredentialStore;
use crate::types::{Item, SourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The two chat services speak different JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatWire {
    A,
    B,
}

/// Wire A: flat message list with a seniority rank.
#[derive(Debug, Deserialize)]
struct WireAResponse {
    messages: Vec<WireAMessage>,
}

#[derive(Debug, Deserialize)]
struct WireAMessage {
    id: String,
    sender: String,
    /// Seniority rank 0..=10 assigned by the room service
    sender_rank: u8,
    text: String,
    /// Unix seconds
    ts: i64,
}

/// Wire B: nested result with karma-bearing user objects.
#[derive(Debug, Deserialize)]
struct WireBResponse {
    result: WireBResult,
}

#[derive(Debug, Deserialize)]
struct WireBResult {
    items: Vec<WireBMessage>,
}

#[derive(Debug, Deserialize)]
struct WireBMessage {
    msg_id: String,
    body: String,
    user: WireBUser,
    /// Unix milliseconds
    posted_at: i64,
}

#[derive(Debug, Deserialize)]
struct WireBUser {
    id: String,
    #[serde(default)]
    karma: i64,
}

fn rank_weight(rank: u8) -> f64 {
    (rank.min(10) as f64 / 10.0).clamp(0.0, 1.0)
}

fn karma_weight(karma: i64) -> f64 {
    if karma <= 0 {
        return 0.1;
    }
    ((karma as f64 + 1.0).log10() / 4.0).clamp(0.1, 1.0)
}

pub struct ChatCollector {
    name: String,
    wire: ChatWire,
    source: SourceKind,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    rate_limiter: Arc<SourceRateLimiter>,
    max_items: usize,
}

impl ChatCollector {
    pub fn new(
        name: String,
        wire: ChatWire,
        client: reqwest::Client,
        base_url: String,
        credentials: Arc<CredentialStore>,
        rate_limiter: Arc<SourceRateLimiter>,
        max_items: usize,
    ) -> Self {
        let source = match wire {
            ChatWire::A => SourceKind::ChatA,
            ChatWire::B => SourceKind::ChatB,
        };
        Self {
            name,
            wire,
            source,
            client,
            base_url,
            credentials,
            rate_limiter,
            max_items,
        }
    }

    /// Room naming convention shared with the room service deployments.
    fn room_for(symbol: &str) -> String {
        format!("{}-general", symbol.to_lowercase())
    }

    async fn fetch_room(
        &self,
        window: CollectWindow,
        symbol: &str,
    ) -> Result<Vec<Item>, CollectError> {
        let token = self
            .credentials
            .get(&self.name)
            .await
            .ok_or_else(|| CollectError::Terminal(format!("no credential for {}", self.name)))?;

        let room = Self::room_for(symbol);
        let response = self
            .client
            .get(format!("{}/rooms/{}/messages", self.base_url, room))
            .bearer_auth(token)
            .query(&[
                ("after", window.start_ts.to_string()),
                ("before", window.end_ts.to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CollectError::from_status(response.status(), &self.name));
        }

        let items = match self.wire {
            ChatWire::A => {
                let payload: WireAResponse = response
                    .json()
                    .await
                    .map_err(|e| CollectError::Terminal(format!("malformed wire-A payload: {}", e)))?;
                payload
                    .messages
                    .into_iter()
                    .filter(|message| window.contains(message.ts))
                    .map(|message| {
                        Item::new(
                            format!("chat_a:{}:{}", room, message.id),
                            self.source,
                            message.text,
                            message.sender,
                            rank_weight(message.sender_rank),
                            message.ts,
                            vec![symbol.to_string()],
                        )
                    })
                    .collect()
            }
            ChatWire::B => {
                let payload: WireBResponse = response
                    .json()
                    .await
                    .map_err(|e| CollectError::Terminal(format!("malformed wire-B payload: {}", e)))?;
                payload
                    .result
                    .items
                    .into_iter()
                    .filter(|message| window.contains(message.posted_at / 1000))
                    .map(|message| {
                        Item::new(
                            format!("chat_b:{}:{}", room, message.msg_id),
                            self.source,
                            message.body,
                            message.user.id,
                            karma_weight(message.user.karma),
                            message.posted_at / 1000,
                            vec![symbol.to_string()],
                        )
                    })
                    .collect()
            }
        };
        Ok(items)
    }
}

#[async_trait]
impl Collector for ChatCollector {
    fn source(&self) -> SourceKind {
        self.source
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
        for symbol in assets {
            if !self.rate_limiter.acquire_until(ctx.deadline).await {
                return Err(CollectError::Cancelled);
            }
            items.extend(self.fetch_room(window, symbol).await?);
            if items.len() >= self.max_items {
                break;
            }
        }

        debug!("chat collector fetched {} messages", items.len());
        Ok(CollectBatch {
            items: finalize_batch(items, self.max_items),
            next_cursor: None,
        })
    }
}
