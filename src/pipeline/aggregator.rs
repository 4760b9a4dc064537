//! Weighted fold of scored items into one sample per asset.

use crate::types::{confidence_to_bp, polarity_to_fp, AssetSample, ScoredItem};
use ethers_core::types::Address;
use tracing::{debug, instrument};

/// Reference sample count for confidence saturation: confidence grows with
/// log(1+n) and reaches the item-level mean at n = N_REF.
const N_REF: f64 = 1000.0;

/// Minimum total weight below which an aggregate is dropped.
const MIN_TOTAL_WEIGHT: f64 = 1e-9;

/// Stateless per-asset aggregator.
#[derive(Debug, Clone, Default)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    /// Fold one asset's items into a sample. Returns `None` when the items
    /// carry no usable weight (the AggregateEmpty case, expected under
    /// normal operation).
    #[instrument(skip(self, items), fields(symbol = %symbol, n = items.len()))]
    pub fn aggregate(
        &self,
        asset: Address,
        symbol: &str,
        items: &[ScoredItem],
        window_end_ts: u64,
    ) -> Option<AssetSample> {
        if items.is_empty() {
            return None;
        }

        let mut weighted_polarity = 0.0;
        let mut total_weight = 0.0;
        let mut confidence_sum = 0.0;
        for scored in items {
            let weight = scored.item.author_weight * scored.confidence;
            weighted_polarity += weight * scored.polarity;
            total_weight += weight;
            confidence_sum += scored.confidence;
        }

        if total_weight < MIN_TOTAL_WEIGHT {
            debug!("aggregate dropped: total weight below threshold");
            return None;
        }

        let n = items.len() as f64;
        let score = weighted_polarity / total_weight;
        let mean_confidence = confidence_sum / n;
        let saturation = ((1.0 + n).ln() / (1.0 + N_REF).ln()).min(1.0);
        let confidence = (mean_confidence * saturation).clamp(0.0, 1.0);

        let sample = AssetSample {
            asset,
            symbol: symbol.to_string(),
            score_fp: polarity_to_fp(score),
            confidence_bp: confidence_to_bp(confidence),
            sample_size: items.len() as u32,
            window_end_ts,
            manipulation_score: 0.0,
        };
        debug_assert!(sample.check_invariants());
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Item, SourceKind, SCORE_SCALE};

    fn create_scored_item(
        id: &str,
        polarity: f64,
        confidence: f64,
        author_weight: f64,
        created_at: i64,
    ) -> ScoredItem {
        ScoredItem {
            item: Item::new(
                id,
                SourceKind::Microblog,
                "text",
                "author",
                author_weight,
                created_at,
                vec!["AAA".to_string()],
            ),
            polarity,
            confidence,
            degraded: false,
        }
    }

    fn test_asset() -> Address {
        Address::repeat_byte(0xaa)
    }

    #[test]
    fn test_uniform_items_match_expected_values() {
        // Ten items, polarity 0.6, confidence 0.9, author weight 0.5:
        // score = 0.6, confidence = 0.9 * ln(11)/ln(1001) -> 3124 bp.
        let items: Vec<ScoredItem> = (0..10)
            .map(|i| create_scored_item(&format!("i{}", i), 0.6, 0.9, 0.5, 1000 + i))
            .collect();

        let sample = Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 2000)
            .unwrap();

        assert_eq!(sample.sample_size, 10);
        let expected_fp = 6 * SCORE_SCALE / 10;
        assert!((sample.score_fp - expected_fp).abs() < 1_000);
        assert_eq!(sample.confidence_bp, 3124);
        assert!(sample.check_invariants());
    }

    #[test]
    fn test_empty_input_dropped() {
        assert!(Aggregator::new()
            .aggregate(test_asset(), "AAA", &[], 0)
            .is_none());
    }

    #[test]
    fn test_zero_weight_dropped() {
        let items = vec![
            create_scored_item("a", 0.5, 0.0, 0.5, 0),
            create_scored_item("b", 0.5, 0.7, 0.0, 0),
        ];
        assert!(Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 0)
            .is_none());
    }

    #[test]
    fn test_weighting_prefers_confident_authors() {
        // A heavy, confident positive item should dominate a light,
        // uncertain negative one.
        let items = vec![
            create_scored_item("a", 1.0, 0.9, 0.9, 0),
            create_scored_item("b", -1.0, 0.2, 0.1, 0),
        ];
        let sample = Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 0)
            .unwrap();
        assert!(sample.score_fp > 0);
    }

    #[test]
    fn test_extreme_polarity_stays_in_range() {
        let items: Vec<ScoredItem> = (0..5)
            .map(|i| create_scored_item(&format!("i{}", i), 1.0, 1.0, 1.0, i as i64))
            .collect();
        let sample = Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 0)
            .unwrap();
        assert_eq!(sample.score_fp, SCORE_SCALE);
        assert!(sample.check_invariants());
    }

    #[test]
    fn test_confidence_grows_with_sample_size() {
        let small: Vec<ScoredItem> = (0..5)
            .map(|i| create_scored_item(&format!("s{}", i), 0.5, 0.8, 0.5, i as i64))
            .collect();
        let large: Vec<ScoredItem> = (0..500)
            .map(|i| create_scored_item(&format!("l{}", i), 0.5, 0.8, 0.5, i as i64))
            .collect();

        let aggregator = Aggregator::new();
        let small_sample = aggregator.aggregate(test_asset(), "AAA", &small, 0).unwrap();
        let large_sample = aggregator.aggregate(test_asset(), "AAA", &large, 0).unwrap();
        assert!(large_sample.confidence_bp > small_sample.confidence_bp);
    }

    #[test]
    fn test_confidence_saturates_at_item_mean() {
        // Far past N_REF the aggregate confidence cannot exceed the
        // per-item mean.
        let items: Vec<ScoredItem> = (0..2000)
            .map(|i| create_scored_item(&format!("i{}", i), 0.1, 0.8, 0.5, i as i64))
            .collect();
        let sample = Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 0)
            .unwrap();
        assert!(sample.confidence_bp <= 8000);
    }

    #[test]
    fn test_single_item_sample() {
        let items = vec![create_scored_item("only", -0.4, 0.6, 0.5, 0)];
        let sample = Aggregator::new()
            .aggregate(test_asset(), "AAA", &items, 0)
            .unwrap();
        assert_eq!(sample.sample_size, 1);
        assert!(sample.score_fp < 0);
        assert!(sample.check_invariants());
    }
}
