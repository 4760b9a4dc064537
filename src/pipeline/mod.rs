//! Off-chain sentiment pipeline: collection, deduplication, scoring,
//! aggregation and the manipulation gate, driven in fixed-period cycles.

pub mod aggregator;
pub mod collectors;
pub mod dedup;
pub mod lexicon;
pub mod manipulation;
pub mod orchestrator;
pub mod rate_limit;
pub mod scorer;

pub use aggregator::Aggregator;
pub use collectors::{CollectError, CollectWindow, Collector, CycleContext};
pub use dedup::Deduplicator;
pub use lexicon::LexiconScorer;
pub use manipulation::{ManipulationDetector, ManipulationVerdict};
pub use orchestrator::Orchestrator;
pub use rate_limit::SourceRateLimiter;
pub use scorer::{EnsembleScorer, SentimentModel};
