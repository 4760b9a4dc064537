//! Multi-signal manipulation screening for aggregated samples.
//!
//! Five per-asset signals are combined into a score in [0,1]; samples above
//! the configured threshold are vetoed before submission. Vetoes are not
//! errors: they are counted and logged with the signal breakdown.

use crate::config::ManipulationConfig;
use crate::types::{AssetSample, ScoredItem};
use ethers_core::types::Address;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use tracing::{debug, instrument, warn};

/// Character shingle width for the content-similarity signal.
const SHINGLE_WIDTH: usize = 5;

/// Items beyond this count are excluded from the pairwise similarity scan.
const SIMILARITY_SCAN_CAP: usize = 1000;

/// Inter-arrival coefficient of variation below which posting cadence
/// counts as machine-like.
const BURSTINESS_CV_THRESHOLD: f64 = 0.3;

/// The individual manipulation signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    VolumeSpike,
    ContentSimilarity,
    BotDensity,
    SourceDivergence,
    Burstiness,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::VolumeSpike => "volume_spike",
            Signal::ContentSimilarity => "content_similarity",
            Signal::BotDensity => "bot_density",
            Signal::SourceDivergence => "source_divergence",
            Signal::Burstiness => "burstiness",
        }
    }
}

/// Outcome of screening one sample.
#[derive(Debug, Clone)]
pub struct ManipulationVerdict {
    /// Mean of the active signal contributions, in [0,1]
    pub score: f64,
    /// Active signals and their contributions
    pub breakdown: Vec<(Signal, f64)>,
    /// True when `score` exceeded the veto threshold
    pub vetoed: bool,
}

/// Per-asset sample-size history entry for the volume-spike signal.
#[derive(Debug, Clone, Copy)]
struct CycleStats {
    sample_size: u32,
}

/// Stateful detector; holds the last K cycles of per-asset history.
pub struct ManipulationDetector {
    config: ManipulationConfig,
    history: HashMap<Address, VecDeque<CycleStats>>,
}

impl ManipulationDetector {
    pub fn new(config: ManipulationConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Screen one asset's sample against its items and history, then roll
    /// the sample into the history window.
    #[instrument(skip(self, items, sample), fields(symbol = %sample.symbol, n = items.len()))]
    pub fn evaluate(&mut self, items: &[ScoredItem], sample: &AssetSample) -> ManipulationVerdict {
        let mut breakdown = Vec::new();

        if let Some(contribution) = self.volume_spike(sample.asset, sample.sample_size) {
            breakdown.push((Signal::VolumeSpike, contribution));
        }
        if let Some(contribution) = self.content_similarity(items) {
            breakdown.push((Signal::ContentSimilarity, contribution));
        }
        if let Some(contribution) = self.bot_density(items) {
            breakdown.push((Signal::BotDensity, contribution));
        }
        if let Some(contribution) = self.source_divergence(items) {
            breakdown.push((Signal::SourceDivergence, contribution));
        }
        if let Some(contribution) = self.burstiness(items) {
            breakdown.push((Signal::Burstiness, contribution));
        }

        let score = if breakdown.is_empty() {
            0.0
        } else {
            breakdown.iter().map(|(_, c)| c).sum::<f64>() / breakdown.len() as f64
        };
        let vetoed = score > self.config.threshold;

        if vetoed {
            let detail: Vec<String> = breakdown
                .iter()
                .map(|(signal, c)| format!("{}={:.2}", signal.as_str(), c))
                .collect();
            warn!(
                symbol = %sample.symbol,
                score,
                "sample vetoed for manipulation: {}",
                detail.join(", ")
            );
        } else {
            debug!(score, "sample passed manipulation screen");
        }

        self.record_cycle(sample.asset, sample.sample_size);

        ManipulationVerdict {
            score,
            breakdown,
            vetoed,
        }
    }

    /// Roll one cycle's sample size into the asset's history window.
    fn record_cycle(&mut self, asset: Address, sample_size: u32) {
        let window = self.history.entry(asset).or_default();
        window.push_back(CycleStats { sample_size });
        while window.len() > self.config.history_cycles {
            window.pop_front();
        }
    }

    /// Z-score of the sample size against the rolling history, squashed
    /// through a sigmoid centered at z = 3.
    fn volume_spike(&self, asset: Address, sample_size: u32) -> Option<f64> {
        let window = self.history.get(&asset)?;
        if window.len() < 2 {
            return None;
        }
        let n = sample_size as f64;
        let count = window.len() as f64;
        let mean = window.iter().map(|s| s.sample_size as f64).sum::<f64>() / count;
        let variance = window
            .iter()
            .map(|s| (s.sample_size as f64 - mean).powi(2))
            .sum::<f64>()
            / count;
        let std = variance.sqrt();

        let z = if std < 1e-9 {
            if n > mean + 0.5 {
                6.0
            } else {
                0.0
            }
        } else {
            (n - mean) / std
        };
        Some(sigmoid((z - 3.0) / 1.5))
    }

    /// Fraction of items whose text is a near-duplicate of at least one
    /// other item in the batch.
    fn content_similarity(&self, items: &[ScoredItem]) -> Option<f64> {
        if items.len() < 2 {
            return None;
        }
        let scanned = items.len().min(SIMILARITY_SCAN_CAP);
        if scanned < items.len() {
            debug!(
                "similarity scan capped at {} of {} items",
                scanned,
                items.len()
            );
        }

        let shingle_sets: Vec<HashSet<u64>> = items[..scanned]
            .iter()
            .map(|scored| shingles(&scored.item.text))
            .collect();

        let mut near_duplicate = vec![false; scanned];
        for i in 0..scanned {
            for j in (i + 1)..scanned {
                if near_duplicate[i] && near_duplicate[j] {
                    continue;
                }
                if jaccard(&shingle_sets[i], &shingle_sets[j]) >= self.config.similarity_threshold {
                    near_duplicate[i] = true;
                    near_duplicate[j] = true;
                }
            }
        }

        let duplicates = near_duplicate.iter().filter(|&&d| d).count();
        Some(duplicates as f64 / scanned as f64)
    }

    /// Share of items posted by authors at or below the bot weight
    /// threshold.
    fn bot_density(&self, items: &[ScoredItem]) -> Option<f64> {
        if items.is_empty() {
            return None;
        }
        let bots = items
            .iter()
            .filter(|scored| scored.item.author_weight <= self.config.bot_weight_threshold)
            .count();
        Some(bots as f64 / items.len() as f64)
    }

    /// Spread between per-source mean polarities, contributing only past
    /// the divergence threshold.
    fn source_divergence(&self, items: &[ScoredItem]) -> Option<f64> {
        let mut per_source: HashMap<&'static str, (f64, usize)> = HashMap::new();
        for scored in items {
            let entry = per_source.entry(scored.item.source.as_str()).or_insert((0.0, 0));
            entry.0 += scored.polarity;
            entry.1 += 1;
        }
        if per_source.len() < 2 {
            return None;
        }
        let means: Vec<f64> = per_source
            .values()
            .map(|(sum, count)| sum / *count as f64)
            .collect();
        let max = means.iter().cloned().fold(f64::MIN, f64::max);
        let min = means.iter().cloned().fold(f64::MAX, f64::min);
        let spread = max - min;
        if spread > self.config.divergence_threshold {
            Some(spread / 2.0)
        } else {
            Some(0.0)
        }
    }

    /// Machine-like posting cadence: low variance of inter-arrival times.
    fn burstiness(&self, items: &[ScoredItem]) -> Option<f64> {
        if items.len() < 5 {
            return None;
        }
        let mut arrivals: Vec<i64> = items.iter().map(|s| s.item.created_at).collect();
        arrivals.sort_unstable();
        let gaps: Vec<f64> = arrivals
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64)
            .collect();

        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean <= 0.0 {
            // Everything arrived in the same second.
            return Some(1.0);
        }
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        let cv = variance.sqrt() / mean;
        Some((1.0 - cv / BURSTINESS_CV_THRESHOLD).clamp(0.0, 1.0))
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Character 5-gram hashes of the lowercase text. Short texts hash whole.
fn shingles(text: &str) -> HashSet<u64> {
    let normalized: Vec<char> = text.to_lowercase().chars().collect();
    let mut set = HashSet::new();
    if normalized.len() < SHINGLE_WIDTH {
        set.insert(hash_chars(&normalized));
        return set;
    }
    for window in normalized.windows(SHINGLE_WIDTH) {
        set.insert(hash_chars(window));
    }
    set
}

fn hash_chars(chars: &[char]) -> u64 {
    let mut hasher = DefaultHasher::new();
    chars.hash(&mut hasher);
    hasher.finish()
}

fn jaccard(a: &HashSet<u64>, b: &HashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}
