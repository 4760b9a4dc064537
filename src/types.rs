//! Core types and data structures shared across the sentiment pipeline.

use ethers_core::types::Address;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

/// Fixed-point scale for sentiment scores: score_fp = score * 10^18.
pub const SCORE_SCALE: i128 = 1_000_000_000_000_000_000;

/// Confidence is expressed on-chain in basis points, 0..=10000.
pub const CONFIDENCE_SCALE_BP: u16 = 10_000;

/// Item text is truncated to this many bytes before scoring.
pub const MAX_TEXT_BYTES: usize = 4096;

/// Social/news platforms the collectors pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// News article feeds
    News,
    /// Short-form public microblog posts
    Microblog,
    /// Chat rooms, wire format A
    ChatA,
    /// Chat rooms, wire format B
    ChatB,
    /// Deterministic synthetic source for local runs and tests
    Simulated,
}

impl SourceKind {
    /// Returns the string representation of the source for logs and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::News => "news",
            SourceKind::Microblog => "microblog",
            SourceKind::ChatA => "chat_a",
            SourceKind::ChatB => "chat_b",
            SourceKind::Simulated => "simulated",
        }
    }

    /// Returns all real (non-synthetic) sources.
    pub fn all() -> Vec<SourceKind> {
        vec![
            SourceKind::News,
            SourceKind::Microblog,
            SourceKind::ChatA,
            SourceKind::ChatB,
        ]
    }
}

/// One social/news post as returned by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, globally unique within its source. Sufficient for
    /// deduplication across the configured horizon.
    pub id: String,
    /// Source platform this item came from
    pub source: SourceKind,
    /// UTF-8 text, truncated to [`MAX_TEXT_BYTES`]
    pub text: String,
    /// Opaque author identifier
    pub author_id: String,
    /// Author weight in [0,1] derived from source-specific signals
    pub author_weight: f64,
    /// Unix timestamp (seconds) the item was created at its source
    pub created_at: i64,
    /// Asset symbols this item pertains to
    pub asset_tags: Vec<String>,
    /// Source-specific opaque bag
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Item {
    /// Build an item, clamping the author weight and truncating oversized
    /// text on a char boundary.
    pub fn new(
        id: impl Into<String>,
        source: SourceKind,
        text: impl Into<String>,
        author_id: impl Into<String>,
        author_weight: f64,
        created_at: i64,
        asset_tags: Vec<String>,
    ) -> Self {
        let mut text = text.into();
        if text.len() > MAX_TEXT_BYTES {
            let mut cut = MAX_TEXT_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Self {
            id: id.into(),
            source,
            text,
            author_id: author_id.into(),
            author_weight: author_weight.clamp(0.0, 1.0),
            created_at,
            asset_tags,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Default author weight when a source has no signal for the author.
pub const DEFAULT_AUTHOR_WEIGHT: f64 = 0.5;

/// An item plus the scorer's calibrated output.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: Item,
    /// Polarity in [-1, 1]
    pub polarity: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// True when the primary model was unavailable and the lexicon
    /// fallback scored alone
    pub degraded: bool,
}

/// Aggregated sentiment for one (asset, window) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetSample {
    /// On-chain asset identifier
    pub asset: Address,
    /// Configured symbol, kept for logs only
    pub symbol: String,
    /// Fixed-point score in [-10^18, 10^18]
    pub score_fp: i128,
    /// Confidence in basis points, 0..=10000
    pub confidence_bp: u16,
    /// Count of contributing items, >= 1
    pub sample_size: u32,
    /// Unix timestamp (seconds) of the window end
    pub window_end_ts: u64,
    /// Manipulation evidence in [0, 1]
    pub manipulation_score: f64,
}

impl AssetSample {
    /// Check the invariants every emitted sample must satisfy.
    pub fn check_invariants(&self) -> bool {
        self.score_fp.abs() <= SCORE_SCALE
            && self.confidence_bp <= CONFIDENCE_SCALE_BP
            && self.sample_size >= 1
            && (0.0..=1.0).contains(&self.manipulation_score)
    }
}

/// The submitter's unit of work: surviving samples for one cycle.
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub samples: NonEmpty<AssetSample>,
    /// Window the samples were aggregated over
    pub window_end_ts: u64,
}

impl SubmissionJob {
    /// Assemble a job from samples that passed the manipulation gate.
    /// Returns `None` when nothing survived.
    pub fn assemble(samples: Vec<AssetSample>, window_end_ts: u64) -> Option<Self> {
        NonEmpty::from_vec(samples).map(|samples| Self {
            samples,
            window_end_ts,
        })
    }
}

/// One accepted on-chain record per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleEntry {
    pub score_fp: i128,
    pub timestamp: u64,
    pub sample_size: u32,
    pub confidence_bp: u16,
}

/// Convert a polarity in [-1, 1] to the fixed-point on-chain representation.
/// Inputs outside the range are clamped.
pub fn polarity_to_fp(polarity: f64) -> i128 {
    let clamped = polarity.clamp(-1.0, 1.0);
    let fp = (clamped * SCORE_SCALE as f64).round() as i128;
    fp.clamp(-SCORE_SCALE, SCORE_SCALE)
}

/// Convert a confidence in [0, 1] to basis points.
pub fn confidence_to_bp(confidence: f64) -> u16 {
    let clamped = confidence.clamp(0.0, 1.0);
    ((clamped * CONFIDENCE_SCALE_BP as f64).round() as u32).min(CONFIDENCE_SCALE_BP as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_str_roundtrip() {
        for kind in SourceKind::all() {
            assert!(!kind.as_str().is_empty());
        }
        assert_eq!(SourceKind::ChatA.as_str(), "chat_a");
    }

    #[test]
    fn test_item_truncates_long_text() {
        let text = "x".repeat(MAX_TEXT_BYTES + 100);
        let item = Item::new("id", SourceKind::News, text, "a", 0.5, 0, vec![]);
        assert_eq!(item.text.len(), MAX_TEXT_BYTES);
    }

    #[test]
    fn test_item_truncation_respects_char_boundary() {
        // Multi-byte chars must not be split mid-sequence.
        let text = "é".repeat(MAX_TEXT_BYTES);
        let item = Item::new("id", SourceKind::News, text, "a", 0.5, 0, vec![]);
        assert!(item.text.len() <= MAX_TEXT_BYTES);
        assert!(item.text.is_char_boundary(item.text.len()));
    }

    #[test]
    fn test_item_clamps_author_weight() {
        let item = Item::new("id", SourceKind::News, "t", "a", 3.0, 0, vec![]);
        assert_eq!(item.author_weight, 1.0);
        let item = Item::new("id", SourceKind::News, "t", "a", -1.0, 0, vec![]);
        assert_eq!(item.author_weight, 0.0);
    }

    #[test]
    fn test_polarity_to_fp_bounds() {
        assert_eq!(polarity_to_fp(1.0), SCORE_SCALE);
        assert_eq!(polarity_to_fp(-1.0), -SCORE_SCALE);
        assert_eq!(polarity_to_fp(0.0), 0);
        // Clamped, never outside the contract range
        assert_eq!(polarity_to_fp(2.5), SCORE_SCALE);
        assert!(polarity_to_fp(f64::NAN).abs() <= SCORE_SCALE);
    }

    #[test]
    fn test_confidence_to_bp_bounds() {
        assert_eq!(confidence_to_bp(0.0), 0);
        assert_eq!(confidence_to_bp(1.0), 10_000);
        assert_eq!(confidence_to_bp(0.5), 5_000);
        assert_eq!(confidence_to_bp(7.0), 10_000);
    }

    #[test]
    fn test_sample_invariants() {
        let sample = AssetSample {
            asset: Address::repeat_byte(1),
            symbol: "AAA".to_string(),
            score_fp: SCORE_SCALE,
            confidence_bp: 10_000,
            sample_size: 1,
            window_end_ts: 1_700_000_000,
            manipulation_score: 0.0,
        };
        assert!(sample.check_invariants());

        let mut bad = sample.clone();
        bad.score_fp = SCORE_SCALE + 1;
        assert!(!bad.check_invariants());

        let mut bad = sample.clone();
        bad.sample_size = 0;
        assert!(!bad.check_invariants());

        let mut bad = sample;
        bad.confidence_bp = 10_001;
        assert!(!bad.check_invariants());
    }

    #[test]
    fn test_job_assemble_rejects_empty() {
        assert!(SubmissionJob::assemble(vec![], 0).is_none());
    }
}
