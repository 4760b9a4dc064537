//! sentio - off-chain sentiment oracle node
//!
//! Harvests public text from social/news sources, folds it into per-asset
//! sentiment samples, screens for coordinated manipulation and submits the
//! survivors to an on-chain oracle contract under nonce, rate-limit and
//! circuit-breaker discipline.

pub mod chain;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod secrets;
pub mod storage;
pub mod types;

// Re-export the main building blocks for embedders and tests
pub use config::NodeConfig;
pub use metrics::PipelineMetrics;
pub use types::{AssetSample, Item, OracleEntry, ScoredItem, SourceKind, SubmissionJob};
