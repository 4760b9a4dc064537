//! Synthetic item source for local runs and integration tests.
//!
//! Deterministic per (window, symbol): replaying the same window yields the
//! same ids, so the deduplicator sees realistic replay traffic.

use crate::pipeline::collectors::{
    finalize_batch, CollectBatch, CollectError, CollectWindow, Collector, CycleContext,
};
use crate::types::{Item, SourceKind};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const PHRASES_POSITIVE: &[&str] = &[
    "strong rally expected after the upgrade",
    "solid gains, very bullish on this one",
    "breakout confirmed, momentum looks great",
];

const PHRASES_NEGATIVE: &[&str] = &[
    "this looks weak, expect a drop",
    "bearish structure, heavy losses incoming",
    "sell pressure building, risky hold",
];

const PHRASES_NEUTRAL: &[&str] = &[
    "volume unchanged since yesterday",
    "watching the chart, nothing to report",
    "sideways action all week",
];

/// Deterministic synthetic collector.
pub struct SimCollector {
    name: String,
    /// Items generated per symbol per window
    items_per_symbol: usize,
    /// Bias in [-1, 1] shifting the positive/negative phrase mix
    sentiment_bias: f64,
    max_items: usize,
}

impl SimCollector {
    pub fn new(name: String, items_per_symbol: usize, sentiment_bias: f64, max_items: usize) -> Self {
        Self {
            name,
            items_per_symbol,
            sentiment_bias: sentiment_bias.clamp(-1.0, 1.0),
            max_items,
        }
    }

    fn seed_for(window: CollectWindow, symbol: &str) -> u64 {
        let mut seed = window.start_ts as u64;
        for byte in symbol.bytes() {
            seed = seed.wrapping_mul(31).wrapping_add(byte as u64);
        }
        seed
    }

    fn generate_for(&self, window: CollectWindow, symbol: &str) -> Vec<Item> {
        let mut rng = StdRng::seed_from_u64(Self::seed_for(window, symbol));
        let span = (window.end_ts - window.start_ts).max(1);
        let mut items = Vec::with_capacity(self.items_per_symbol);

        for index in 0..self.items_per_symbol {
            let roll: f64 = rng.gen_range(-1.0..1.0) + self.sentiment_bias;
            let phrase = if roll > 0.3 {
                PHRASES_POSITIVE[rng.gen_range(0..PHRASES_POSITIVE.len())]
            } else if roll < -0.3 {
                PHRASES_NEGATIVE[rng.gen_range(0..PHRASES_NEGATIVE.len())]
            } else {
                PHRASES_NEUTRAL[rng.gen_range(0..PHRASES_NEUTRAL.len())]
            };

            let created_at = window.start_ts + rng.gen_range(0..span);
            let author = rng.gen_range(0..50u32);
            items.push(Item::new(
                format!("sim:{}:{}:{}", symbol, window.start_ts, index),
                SourceKind::Simulated,
                format!("{} ({})", phrase, symbol),
                format!("sim-author-{}", author),
                rng.gen_range(0.2..0.9),
                created_at,
                vec![symbol.to_string()],
            ));
        }
        items
    }
}

#[async_trait]
impl Collector for SimCollector {
    fn source(&self) -> SourceKind {
        SourceKind::Simulated
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(
        &self,
        _ctx: &CycleContext,
        window: CollectWindow,
        assets: &[String],
    ) -> Result<CollectBatch, CollectError> {
        let mut items = Vec::new();
        for symbol in assets {
            items.extend(self.generate_for(window, symbol));
        }
        debug!("sim collector generated {} items", items.len());
        Ok(CollectBatch {
            items: finalize_batch(items, self.max_items),
            next_cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn test_ctx() -> CycleContext {
        CycleContext {
            cycle_id: 1,
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_deterministic_replay() {
        let collector = SimCollector::new("sim".to_string(), 20, 0.0, 10_000);
        let window = CollectWindow {
            start_ts: 1_700_000_000,
            end_ts: 1_700_000_300,
        };
        let assets = vec!["AAA".to_string()];

        let first = collector.collect(&test_ctx(), window, &assets).await.unwrap();
        let second = collector.collect(&test_ctx(), window, &assets).await.unwrap();

        let first_ids: Vec<&String> = first.items.iter().map(|i| &i.id).collect();
        let second_ids: Vec<&String> = second.items.iter().map(|i| &i.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_distinct_windows_distinct_ids() {
        let collector = SimCollector::new("sim".to_string(), 5, 0.0, 10_000);
        let assets = vec!["AAA".to_string()];
        let first = collector
            .collect(
                &test_ctx(),
                CollectWindow {
                    start_ts: 0,
                    end_ts: 300,
                },
                &assets,
            )
            .await
            .unwrap();
        let second = collector
            .collect(
                &test_ctx(),
                CollectWindow {
                    start_ts: 300,
                    end_ts: 600,
                },
                &assets,
            )
            .await
            .unwrap();
        for item in &second.items {
            assert!(!first.items.iter().any(|other| other.id == item.id));
        }
    }

    #[tokio::test]
    async fn test_items_inside_window_and_sorted() {
        let collector = SimCollector::new("sim".to_string(), 50, 0.0, 10_000);
        let window = CollectWindow {
            start_ts: 1_000,
            end_ts: 1_300,
        };
        let batch = collector
            .collect(&test_ctx(), window, &["AAA".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 50);
        for pair in batch.items.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        for item in &batch.items {
            assert!(window.contains(item.created_at));
        }
    }

    #[tokio::test]
    async fn test_cap_respected() {
        let collector = SimCollector::new("sim".to_string(), 100, 0.0, 30);
        let batch = collector
            .collect(
                &test_ctx(),
                CollectWindow {
                    start_ts: 0,
                    end_ts: 300,
                },
                &["AAA".to_string(), "BBB".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 30);
    }
}
