//! Collector abstraction and its retry/rate discipline.
//!
//! Collectors are pure sources: they fetch a bounded batch of items for a
//! time window, never score and never persist. Transient failures retry
//! with exponential backoff inside the source; terminal failures skip the
//! source for the cycle.

pub mod chat;
pub mod microblog;
pub mod news;
pub mod sim;

pub use chat::{ChatCollector, ChatWire};
pub use microblog::MicroblogCollector;
pub use news::NewsCollector;
pub use sim::SimCollector;

use crate::metrics::PipelineMetrics;
use crate::types::{Item, SourceKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Context shared by all stages of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    /// Monotone cycle counter, for logs
    pub cycle_id: u64,
    /// Hard deadline; every suspension point gives up here
    pub deadline: Instant,
}

impl CycleContext {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Closed-open collection window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectWindow {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl CollectWindow {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ts && ts < self.end_ts
    }
}

/// One collector response.
#[derive(Debug, Default)]
pub struct CollectBatch {
    /// Items in stable `created_at` order
    pub items: Vec<Item>,
    /// Opaque resume cursor, when the source paginates beyond the cap
    pub next_cursor: Option<String>,
}

/// Collector failures, split by retry semantics.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Worth retrying with backoff inside this cycle
    #[error("transient source error: {0}")]
    Transient(String),
    /// Skip the source for this cycle
    #[error("terminal source error: {0}")]
    Terminal(String),
    /// The cycle deadline arrived mid-collection
    #[error("collection cancelled at cycle deadline")]
    Cancelled,
}

impl CollectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollectError::Transient(_))
    }

    /// Map an HTTP status onto the retry taxonomy. Rate-limit and server
    /// errors retry; auth and client errors do not.
    pub fn from_status(status: reqwest::StatusCode, source: &str) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            CollectError::Transient(format!("{} returned {}", source, status))
        } else {
            CollectError::Terminal(format!("{} returned {}", source, status))
        }
    }
}

impl From<reqwest::Error> for CollectError {
    fn from(e: reqwest::Error) -> Self {
        // Network-level failures are worth retrying.
        CollectError::Transient(e.to_string())
    }
}

/// A bounded, window-scoped item source.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source(&self) -> SourceKind;
    /// Configured instance name, also the credential key
    fn name(&self) -> &str;

    /// Fetch items with `created_at` inside the window, tagged with any of
    /// `assets`, capped and stably ordered by `created_at`.
    async fn collect(
        &self,
        ctx: &CycleContext,
        window: CollectWindow,
        assets: &[String],
    ) -> Result<CollectBatch, CollectError>;
}

/// Backoff schedule for transient source errors: 500 ms base, doubling,
/// capped at 30 s, at most 5 attempts.
fn transient_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(30))
        .map(jitter)
        .take(4)
}

/// Run one collector with the transient-retry policy. Terminal errors and
/// deadline expiry pass straight through.
pub async fn collect_with_retry(
    collector: &dyn Collector,
    ctx: &CycleContext,
    window: CollectWindow,
    assets: &[String],
    metrics: &Arc<PipelineMetrics>,
) -> Result<CollectBatch, CollectError> {
    let result = RetryIf::spawn(
        transient_backoff(),
        || async {
            if ctx.expired() {
                return Err(CollectError::Cancelled);
            }
            collector.collect(ctx, window, assets).await
        },
        |e: &CollectError| {
            let retry = e.is_transient() && !ctx.expired();
            if retry {
                PipelineMetrics::inc(&metrics.source_transient_errors);
                debug!("retrying {} after transient error: {}", collector.name(), e);
            }
            retry
        },
    )
    .await;

    match &result {
        Ok(batch) => {
            debug!(
                "{} collected {} items for cycle {}",
                collector.name(),
                batch.items.len(),
                ctx.cycle_id
            );
        }
        Err(CollectError::Terminal(e)) => {
            PipelineMetrics::inc(&metrics.source_terminal_errors);
            warn!("{} skipped for cycle {}: {}", collector.name(), ctx.cycle_id, e);
        }
        Err(CollectError::Cancelled) => {
            PipelineMetrics::inc(&metrics.collects_cancelled);
        }
        Err(CollectError::Transient(e)) => {
            // Retries exhausted.
            PipelineMetrics::inc(&metrics.source_transient_errors);
            warn!(
                "{} gave up after retries for cycle {}: {}",
                collector.name(),
                ctx.cycle_id,
                e
            );
        }
    }
    result
}

/// Sort by `created_at` (ties by id for a stable order) and truncate to
/// the per-cycle cap. Shared by all collector implementations.
pub(crate) fn finalize_batch(mut items: Vec<Item>, max_items: usize) -> Vec<Item> {
    items.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    items.truncate(max_items);
    items
}
