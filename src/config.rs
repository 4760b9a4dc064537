//! Node configuration: serde-backed sections with defaults and fail-fast
//! validation at startup.

use crate::types::SourceKind;
use ethers_core::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors abort startup; nothing runs on a bad config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub cycle: CycleConfig,
    pub dedup: DedupConfig,
    pub scorer: ScorerConfig,
    pub manipulation: ManipulationConfig,
    pub sources: Vec<SourceConfig>,
    /// Symbol -> on-chain asset address (hex)
    pub assets: HashMap<String, String>,
    pub cohorts: Vec<CohortConfig>,
    pub chain: ChainConfig,
    pub signer: SignerConfig,
    pub storage: StorageConfig,
    /// Path to the secrets file (collector credentials, signer material)
    pub secrets_path: Option<String>,
    /// Log level: trace|debug|info|warn|error
    pub log_level: String,
}

/// Orchestrator cadence and in-cycle parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Cycle period P in seconds
    pub period_s: u64,
    /// Safety margin subtracted from the deadline
    pub jitter_s: u64,
    /// Scoring worker pool size; 0 means min(cpus, 8)
    pub scorer_parallelism: usize,
    /// Bounded queue depth between pipeline stages
    pub stage_queue_depth: usize,
}

/// Deduplication horizon and memory budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Sliding horizon H in seconds
    pub horizon_s: u64,
    /// Maximum tracked item ids
    pub capacity: u64,
}

/// Ensemble scorer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Fusion weight w of the primary classifier
    pub primary_weight: f64,
    /// Inference endpoint of the primary classifier; None runs
    /// lexicon-only (permanently degraded)
    pub primary_url: Option<String>,
    /// Confidence multiplier applied when the primary is unavailable
    pub degraded_confidence_factor: f64,
    /// Per-request timeout for the primary model, seconds
    pub primary_timeout_s: u64,
}

/// Manipulation detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManipulationConfig {
    /// Veto threshold T
    pub threshold: f64,
    /// Cycles of history K used by the volume-spike signal
    pub history_cycles: usize,
    /// Jaccard similarity above which two texts count as near-duplicates
    pub similarity_threshold: f64,
    /// Author weight at or below which an item counts as bot-like
    pub bot_weight_threshold: f64,
    /// Cross-source polarity spread that starts contributing
    pub divergence_threshold: f64,
}

/// One collector instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Unique name, also the credential lookup key in the secrets file
    pub name: String,
    pub base_url: String,
    /// Token-bucket burst size
    pub rate_tokens: u32,
    /// Seconds to refill the full bucket
    pub rate_refill_s: f64,
    /// Per-cycle item cap
    pub max_items: usize,
}

impl SourceConfig {
    fn default_for(kind: SourceKind, name: &str, base_url: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            base_url: base_url.to_string(),
            rate_tokens: 30,
            rate_refill_s: 60.0,
            max_items: 10_000,
        }
    }
}

/// A set of assets sharing collection and submission cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    pub name: String,
    /// Symbols, each of which must resolve in `NodeConfig::assets`
    pub assets: Vec<String>,
    /// Override of the global cycle period
    pub period_s: Option<u64>,
}

/// Chain access and submission discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// JSON-RPC endpoints, tried in health order
    pub rpc_endpoints: Vec<String>,
    /// "rpc" for a live endpoint, "simulated" for the in-process chain
    pub mode: String,
    pub chain_id: u64,
    /// Oracle contract address (hex)
    pub contract: String,
    /// Max samples per batchUpdateSentiment call
    pub batch_size: usize,
    /// Local mirror of the contract's MIN_UPDATE_INTERVAL, seconds
    pub min_update_interval_s: u64,
    /// Local mirror of the contract's MAX_SCORE_CHANGE (fixed point)
    pub max_score_change_fp: i128,
    /// Confirmations required before a tx counts as final
    pub confirmations: u64,
    /// Multiplier applied to the gas estimate
    pub gas_multiplier: f64,
    /// Hard per-transaction gas limit ceiling
    pub gas_ceiling: u64,
    /// Receipt poll interval, seconds
    pub receipt_poll_interval_s: u64,
    /// Seconds without a receipt before a broadcast tx counts as dropped
    pub stall_timeout_s: u64,
    /// RPC request timeout, seconds
    pub rpc_timeout_s: u64,
}

impl ChainConfig {
    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        self.contract
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad contract address: {}", self.contract)))
    }

    pub fn gas_ceiling_u256(&self) -> U256 {
        U256::from(self.gas_ceiling)
    }
}

/// Which signer backs transaction signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// "local" or "remote"
    pub kind: String,
    /// Secrets-file key holding the hex private key (local signer)
    pub key_secret: String,
    /// Signing service endpoint (remote signer)
    pub remote_url: Option<String>,
    /// Key identifier at the signing service (remote signer)
    pub remote_key_id: Option<String>,
    /// Secrets-file key holding the signing-service bearer token
    pub remote_token_secret: String,
}

/// Off-chain durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; ":memory:" for ephemeral runs
    pub db_path: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            dedup: DedupConfig::default(),
            scorer: ScorerConfig::default(),
            manipulation: ManipulationConfig::default(),
            sources: vec![SourceConfig::default_for(
                SourceKind::Simulated,
                "sim",
                "local",
            )],
            assets: HashMap::new(),
            cohorts: Vec::new(),
            chain: ChainConfig::default(),
            signer: SignerConfig::default(),
            storage: StorageConfig::default(),
            secrets_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_s: 300,
            jitter_s: 10,
            scorer_parallelism: 0,
            stage_queue_depth: 1024,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            horizon_s: 86_400,
            capacity: 1_000_000,
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            primary_weight: 0.7,
            primary_url: None,
            degraded_confidence_factor: 0.6,
            primary_timeout_s: 10,
        }
    }
}

impl Default for ManipulationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            history_cycles: 3,
            similarity_threshold: 0.85,
            bot_weight_threshold: 0.2,
            divergence_threshold: 0.6,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_endpoints: vec!["http://127.0.0.1:8545".to_string()],
            mode: "rpc".to_string(),
            chain_id: 1,
            contract: format!("{:#x}", Address::zero()),
            batch_size: 50,
            min_update_interval_s: 240,
            max_score_change_fp: 200_000_000_000_000_000,
            confirmations: 2,
            gas_multiplier: 1.2,
            gas_ceiling: 2_000_000,
            receipt_poll_interval_s: 3,
            stall_timeout_s: 60,
            rpc_timeout_s: 10,
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
            key_secret: "signer_key".to_string(),
            remote_url: None,
            remote_key_id: None,
            remote_token_secret: "signer_token".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./sentio.db".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast sanity checks. Every violation here would otherwise show
    /// up later as wasted gas or a wedged cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.cycle.period_s == 0 {
            return invalid("cycle.period_s must be positive");
        }
        if self.cycle.jitter_s >= self.cycle.period_s {
            return invalid("cycle.jitter_s must be below cycle.period_s");
        }
        if self.cycle.stage_queue_depth == 0 {
            return invalid("cycle.stage_queue_depth must be positive");
        }
        if !(0.0..=1.0).contains(&self.scorer.primary_weight) {
            return invalid("scorer.primary_weight must be in [0,1]");
        }
        if !(0.0..=1.0).contains(&self.scorer.degraded_confidence_factor) {
            return invalid("scorer.degraded_confidence_factor must be in [0,1]");
        }
        if !(0.0..=1.0).contains(&self.manipulation.threshold) {
            return invalid("manipulation.threshold must be in [0,1]");
        }
        if self.manipulation.history_cycles == 0 {
            return invalid("manipulation.history_cycles must be positive");
        }
        if self.chain.batch_size == 0 || self.chain.batch_size > 50 {
            return invalid("chain.batch_size must be in 1..=50");
        }
        if self.chain.rpc_endpoints.is_empty() && self.chain.mode != "simulated" {
            return invalid("chain.rpc_endpoints must not be empty");
        }
        if self.chain.mode != "rpc" && self.chain.mode != "simulated" {
            return invalid("chain.mode must be \"rpc\" or \"simulated\"");
        }
        if self.chain.gas_multiplier < 1.0 {
            return invalid("chain.gas_multiplier must be >= 1.0");
        }
        if self.chain.max_score_change_fp <= 0 {
            return invalid("chain.max_score_change_fp must be positive");
        }
        self.chain.contract_address()?;
        if self.signer.kind != "local" && self.signer.kind != "remote" {
            return invalid("signer.kind must be \"local\" or \"remote\"");
        }
        if self.signer.kind == "remote" && self.signer.remote_url.is_none() {
            return invalid("signer.remote_url is required for the remote signer");
        }

        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return invalid(format!("duplicate source name: {}", source.name));
            }
            if source.rate_tokens == 0 || source.rate_refill_s <= 0.0 {
                return invalid(format!("source {} has an empty rate budget", source.name));
            }
            if source.max_items == 0 {
                return invalid(format!("source {} has max_items = 0", source.name));
            }
        }

        for (symbol, address) in &self.assets {
            if address.parse::<Address>().is_err() {
                return invalid(format!("asset {} has a bad address: {}", symbol, address));
            }
        }
        for cohort in &self.cohorts {
            if cohort.assets.is_empty() {
                return invalid(format!("cohort {} has no assets", cohort.name));
            }
            for symbol in &cohort.assets {
                if !self.assets.contains_key(symbol) {
                    return invalid(format!(
                        "cohort {} references unknown asset {}",
                        cohort.name, symbol
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolve the symbol -> address registry, assuming `validate` passed.
    pub fn asset_registry(&self) -> HashMap<String, Address> {
        self.assets
            .iter()
            .filter_map(|(symbol, address)| {
                address.parse().ok().map(|a| (symbol.clone(), a))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.assets.insert(
            "AAA".to_string(),
            "0x00000000000000000000000000000000000000aa".to_string(),
        );
        config.cohorts.push(CohortConfig {
            name: "main".to_string(),
            assets: vec!["AAA".to_string()],
            period_s: None,
        });
        config
    }

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.cycle.period_s, 300);
        assert_eq!(config.cycle.jitter_s, 10);
        assert_eq!(config.dedup.horizon_s, 86_400);
        assert_eq!(config.dedup.capacity, 1_000_000);
        assert_eq!(config.scorer.primary_weight, 0.7);
        assert_eq!(config.manipulation.threshold, 0.7);
        assert_eq!(config.chain.batch_size, 50);
        assert_eq!(config.chain.min_update_interval_s, 240);
        assert_eq!(config.chain.max_score_change_fp, 200_000_000_000_000_000);
        assert_eq!(config.chain.confirmations, 2);
        assert_eq!(config.chain.gas_multiplier, 1.2);
        assert_eq!(config.signer.kind, "local");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = create_test_config();
        config.chain.batch_size = 51;
        assert!(config.validate().is_err());
        config.chain.batch_size = 0;
        assert!(config.validate().is_err());
        config.chain.batch_size = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jitter_must_be_below_period() {
        let mut config = create_test_config();
        config.cycle.jitter_s = config.cycle.period_s;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_cohort_asset_rejected() {
        let mut config = create_test_config();
        config.cohorts[0].assets.push("BBB".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_asset_address_rejected() {
        let mut config = create_test_config();
        config
            .assets
            .insert("BAD".to_string(), "not-an-address".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_signer_requires_url() {
        let mut config = create_test_config();
        config.signer.kind = "remote".to_string();
        assert!(config.validate().is_err());
        config.signer.remote_url = Some("https://kms.example".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_asset_registry_resolves() {
        let config = create_test_config();
        let registry = config.asset_registry();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("AAA"));
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let mut config = create_test_config();
        config.sources.push(config.sources[0].clone());
        assert!(config.validate().is_err());
    }
}
