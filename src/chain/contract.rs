//! Deterministic reference model of the deployed sentiment oracle.
//!
//! Mirrors the on-chain state machine exactly: the submitter's pre-checks,
//! the simulated chain mode and the invariant tests all run against this
//! model. Single updates revert on any violation; batch updates skip
//! ineligible elements where the contract skips them.

use crate::types::{OracleEntry, CONFIDENCE_SCALE_BP, SCORE_SCALE};
use ethers_core::types::Address;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Hard batch cap enforced by the contract.
pub const BATCH_CAP: usize = 50;

/// Ring-history capacity: 24 h of 5-minute updates.
pub const HISTORY_CAPACITY: usize = 288;

/// Reason code attached to circuit-breaker events.
pub const REASON_SCORE_JUMP: u8 = 1;

/// Deploy-time / admin-tunable parameters.
#[derive(Debug, Clone)]
pub struct OracleContractConfig {
    pub min_update_interval: u64,
    pub max_score_change: i128,
    pub circuit_breaker_enabled: bool,
    pub whitelist_enabled: bool,
}

impl Default for OracleContractConfig {
    fn default() -> Self {
        Self {
            min_update_interval: 240,
            max_score_change: 200_000_000_000_000_000,
            circuit_breaker_enabled: true,
            whitelist_enabled: false,
        }
    }
}

/// Events emitted by accepted writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleEvent {
    SentimentUpdated {
        asset: Address,
        score_fp: i128,
        timestamp: u64,
        confidence_bp: u16,
        sample_size: u32,
    },
    CircuitBreakerTriggered {
        asset: Address,
        reason_code: u8,
    },
    TokenWhitelisted {
        asset: Address,
        status: bool,
    },
}

/// Revert reasons. In batch mode the skippable ones turn into silently
/// skipped elements instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("caller is not an operator")]
    NotOperator,
    #[error("caller is not the owner")]
    NotOwner,
    #[error("contract is paused")]
    Paused,
    #[error("asset address is zero")]
    ZeroAsset,
    #[error("asset is not whitelisted")]
    NotWhitelisted,
    #[error("score outside the fixed-point range")]
    ScoreOutOfRange,
    #[error("confidence above 10000 basis points")]
    ConfidenceOutOfRange,
    #[error("sample size must be at least 1")]
    EmptySample,
    #[error("update arrived before the minimum interval")]
    UpdateTooSoon,
    #[error("score change exceeds the circuit breaker limit")]
    CircuitBreakerTripped,
    #[error("batch exceeds the element cap")]
    BatchTooLarge,
    #[error("batch arrays have mismatched lengths")]
    LengthMismatch,
}

/// The oracle's full mutable state.
pub struct SentimentOracle {
    config: OracleContractConfig,
    owner: Address,
    operators: HashSet<Address>,
    whitelist: HashSet<Address>,
    paused: bool,
    latest: HashMap<Address, OracleEntry>,
    history: HashMap<Address, VecDeque<OracleEntry>>,
    total_updates: u64,
}

impl SentimentOracle {
    /// Deploy with `owner` also granted the operator capability.
    pub fn new(owner: Address, config: OracleContractConfig) -> Self {
        let mut operators = HashSet::new();
        operators.insert(owner);
        Self {
            config,
            owner,
            operators,
            whitelist: HashSet::new(),
            paused: false,
            latest: HashMap::new(),
            history: HashMap::new(),
            total_updates: 0,
        }
    }

    // --- write path ---

    /// `updateSentiment(asset, score, sampleSize, confidence)`.
    pub fn update_sentiment(
        &mut self,
        caller: Address,
        now: u64,
        asset: Address,
        score_fp: i128,
        sample_size: u32,
        confidence_bp: u16,
    ) -> Result<Vec<OracleEvent>, ContractError> {
        self.check_caller(caller)?;
        self.check_element(now, asset, score_fp, sample_size, confidence_bp)?;
        Ok(vec![self.apply(now, asset, score_fp, sample_size, confidence_bp)])
    }

    /// `batchUpdateSentiment(assets, scores, sampleSizes, confidences)`.
    /// Ineligible elements (zero asset, not whitelisted, too soon, breaker)
    /// are skipped; malformed elements still revert the whole batch.
    /// Returns the applied count and the emitted events.
    pub fn batch_update_sentiment(
        &mut self,
        caller: Address,
        now: u64,
        assets: &[Address],
        scores_fp: &[i128],
        sample_sizes: &[u32],
        confidences_bp: &[u16],
    ) -> Result<(u32, Vec<OracleEvent>), ContractError> {
        self.check_caller(caller)?;
        let len = assets.len();
        if len != scores_fp.len() || len != sample_sizes.len() || len != confidences_bp.len() {
            return Err(ContractError::LengthMismatch);
        }
        if len > BATCH_CAP {
            return Err(ContractError::BatchTooLarge);
        }

        let mut applied = 0;
        let mut events = Vec::new();
        for i in 0..len {
            match self.check_element(now, assets[i], scores_fp[i], sample_sizes[i], confidences_bp[i])
            {
                Ok(()) => {
                    events.push(self.apply(
                        now,
                        assets[i],
                        scores_fp[i],
                        sample_sizes[i],
                        confidences_bp[i],
                    ));
                    applied += 1;
                }
                Err(ContractError::ZeroAsset)
                | Err(ContractError::NotWhitelisted)
                | Err(ContractError::UpdateTooSoon) => {
                    debug!("batch element {} skipped", i);
                }
                Err(ContractError::CircuitBreakerTripped) => {
                    events.push(OracleEvent::CircuitBreakerTriggered {
                        asset: assets[i],
                        reason_code: REASON_SCORE_JUMP,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((applied, events))
    }

    fn check_caller(&self, caller: Address) -> Result<(), ContractError> {
        if self.paused {
            return Err(ContractError::Paused);
        }
        if !self.operators.contains(&caller) {
            return Err(ContractError::NotOperator);
        }
        Ok(())
    }

    fn check_element(
        &self,
        now: u64,
        asset: Address,
        score_fp: i128,
        sample_size: u32,
        confidence_bp: u16,
    ) -> Result<(), ContractError> {
        if asset == Address::zero() {
            return Err(ContractError::ZeroAsset);
        }
        if self.config.whitelist_enabled && !self.whitelist.contains(&asset) {
            return Err(ContractError::NotWhitelisted);
        }
        if score_fp.abs() > SCORE_SCALE {
            return Err(ContractError::ScoreOutOfRange);
        }
        if confidence_bp > CONFIDENCE_SCALE_BP {
            return Err(ContractError::ConfidenceOutOfRange);
        }
        if sample_size < 1 {
            return Err(ContractError::EmptySample);
        }
        if let Some(last) = self.latest.get(&asset) {
            if now < last.timestamp + self.config.min_update_interval {
                return Err(ContractError::UpdateTooSoon);
            }
            // First-update bypass: a zero last score never trips the breaker.
            if self.config.circuit_breaker_enabled && last.score_fp != 0 {
                let change = score_fp
                    .checked_sub(last.score_fp)
                    .map(i128::abs)
                    .unwrap_or(i128::MAX);
                if change > self.config.max_score_change {
                    return Err(ContractError::CircuitBreakerTripped);
                }
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        now: u64,
        asset: Address,
        score_fp: i128,
        sample_size: u32,
        confidence_bp: u16,
    ) -> OracleEvent {
        let entry = OracleEntry {
            score_fp,
            timestamp: now,
            sample_size,
            confidence_bp,
        };
        self.latest.insert(asset, entry);

        let ring = self.history.entry(asset).or_default();
        if ring.len() == HISTORY_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);

        self.total_updates += 1;
        OracleEvent::SentimentUpdated {
            asset,
            score_fp,
            timestamp: now,
            confidence_bp,
            sample_size,
        }
    }

    // --- read path ---

    /// Latest entry per asset.
    pub fn get_sentiment(&self, asset: Address) -> Option<OracleEntry> {
        self.latest.get(&asset).copied()
    }

    /// Last `n` entries, newest first, capped at the ring capacity.
    pub fn get_history(&self, asset: Address, n: usize) -> Vec<OracleEntry> {
        let n = n.min(HISTORY_CAPACITY);
        match self.history.get(&asset) {
            Some(ring) => ring.iter().rev().take(n).copied().collect(),
            None => Vec::new(),
        }
    }

    /// True when the asset has no entry newer than `max_age` seconds.
    pub fn is_stale(&self, asset: Address, max_age: u64, now: u64) -> bool {
        match self.latest.get(&asset) {
            Some(entry) => now.saturating_sub(entry.timestamp) > max_age,
            None => true,
        }
    }

    pub fn total_updates(&self) -> u64 {
        self.total_updates
    }

    // --- admin surface (bound to a timelocked multi-sig in deployment) ---

    fn check_owner(&self, caller: Address) -> Result<(), ContractError> {
        if caller != self.owner {
            return Err(ContractError::NotOwner);
        }
        Ok(())
    }

    pub fn set_paused(&mut self, caller: Address, paused: bool) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.paused = paused;
        Ok(())
    }

    pub fn grant_operator(&mut self, caller: Address, operator: Address) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.operators.insert(operator);
        Ok(())
    }

    pub fn revoke_operator(
        &mut self,
        caller: Address,
        operator: Address,
    ) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.operators.remove(&operator);
        Ok(())
    }

    pub fn set_circuit_breaker(
        &mut self,
        caller: Address,
        enabled: bool,
    ) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.config.circuit_breaker_enabled = enabled;
        Ok(())
    }

    pub fn set_max_score_change(
        &mut self,
        caller: Address,
        max_score_change: i128,
    ) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.config.max_score_change = max_score_change;
        Ok(())
    }

    pub fn set_whitelist_enabled(
        &mut self,
        caller: Address,
        enabled: bool,
    ) -> Result<(), ContractError> {
        self.check_owner(caller)?;
        self.config.whitelist_enabled = enabled;
        Ok(())
    }

    pub fn set_whitelisted(
        &mut self,
        caller: Address,
        asset: Address,
        status: bool,
    ) -> Result<OracleEvent, ContractError> {
        self.check_owner(caller)?;
        if status {
            self.whitelist.insert(asset);
        } else {
            self.whitelist.remove(&asset);
        }
        Ok(OracleEvent::TokenWhitelisted { asset, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Address {
        Address::repeat_byte(0x01)
    }

    fn asset() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn create_oracle() -> SentimentOracle {
        SentimentOracle::new(owner(), OracleContractConfig::default())
    }

    #[test]
    fn test_happy_update_and_roundtrip() {
        let mut oracle = create_oracle();
        let events = oracle
            .update_sentiment(owner(), 1_000, asset(), 600_000_000_000_000_000, 10, 3124)
            .unwrap();
        assert_eq!(events.len(), 1);

        let entry = oracle.get_sentiment(asset()).unwrap();
        assert_eq!(entry.score_fp, 600_000_000_000_000_000);
        assert_eq!(entry.sample_size, 10);
        assert_eq!(entry.confidence_bp, 3124);
        assert_eq!(entry.timestamp, 1_000);
        assert_eq!(oracle.total_updates(), 1);
    }

    #[test]
    fn test_non_operator_rejected() {
        let mut oracle = create_oracle();
        let result = oracle.update_sentiment(Address::repeat_byte(0x99), 0, asset(), 0, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::NotOperator);
    }

    #[test]
    fn test_zero_asset_rejected() {
        let mut oracle = create_oracle();
        let result = oracle.update_sentiment(owner(), 0, Address::zero(), 0, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::ZeroAsset);
    }

    #[test]
    fn test_score_bounds() {
        let mut oracle = create_oracle();
        // Exactly +/- 10^18 is accepted.
        oracle
            .update_sentiment(owner(), 0, asset(), SCORE_SCALE, 1, 0)
            .unwrap();
        let other = Address::repeat_byte(0xbb);
        oracle
            .update_sentiment(owner(), 0, other, -SCORE_SCALE, 1, 0)
            .unwrap();

        let third = Address::repeat_byte(0xcc);
        let result = oracle.update_sentiment(owner(), 0, third, SCORE_SCALE + 1, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::ScoreOutOfRange);
    }

    #[test]
    fn test_confidence_bounds() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 0, asset(), 0, 1, 10_000)
            .unwrap();
        let other = Address::repeat_byte(0xbb);
        let result = oracle.update_sentiment(owner(), 0, other, 0, 1, 10_001);
        assert_eq!(result.unwrap_err(), ContractError::ConfidenceOutOfRange);
    }

    #[test]
    fn test_empty_sample_rejected() {
        let mut oracle = create_oracle();
        let result = oracle.update_sentiment(owner(), 0, asset(), 0, 0, 0);
        assert_eq!(result.unwrap_err(), ContractError::EmptySample);
    }

    #[test]
    fn test_min_interval_boundary() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 1_000, asset(), 100, 1, 50)
            .unwrap();

        // 239 s later: rejected.
        let result = oracle.update_sentiment(owner(), 1_239, asset(), 120, 1, 50);
        assert_eq!(result.unwrap_err(), ContractError::UpdateTooSoon);

        // Exactly 240 s later: accepted.
        oracle
            .update_sentiment(owner(), 1_240, asset(), 120, 1, 50)
            .unwrap();
    }

    #[test]
    fn test_min_interval_skipped_in_batch() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 1_000, asset(), 100, 1, 50)
            .unwrap();

        let other = Address::repeat_byte(0xbb);
        let (applied, events) = oracle
            .batch_update_sentiment(
                owner(),
                1_100,
                &[asset(), other],
                &[150, 200],
                &[1, 1],
                &[50, 50],
            )
            .unwrap();
        // The too-soon element is skipped, the other lands.
        assert_eq!(applied, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(oracle.get_sentiment(asset()).unwrap().score_fp, 100);
        assert_eq!(oracle.get_sentiment(other).unwrap().score_fp, 200);
    }

    #[test]
    fn test_circuit_breaker_trips_on_jump() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 1_000, asset(), 500_000_000_000_000_000, 1, 50)
            .unwrap();

        // Change of 4*10^17 > limit of 2*10^17.
        let result =
            oracle.update_sentiment(owner(), 2_000, asset(), 100_000_000_000_000_000, 1, 50);
        assert_eq!(result.unwrap_err(), ContractError::CircuitBreakerTripped);
        // State unchanged by the revert.
        assert_eq!(
            oracle.get_sentiment(asset()).unwrap().score_fp,
            500_000_000_000_000_000
        );
    }

    #[test]
    fn test_circuit_breaker_first_update_bypass() {
        let mut oracle = create_oracle();
        // No previous entry: any in-range score is fine.
        oracle
            .update_sentiment(owner(), 0, asset(), SCORE_SCALE, 1, 0)
            .unwrap();

        // Previous score of exactly zero also bypasses.
        let other = Address::repeat_byte(0xbb);
        oracle.update_sentiment(owner(), 0, other, 0, 1, 0).unwrap();
        oracle
            .update_sentiment(owner(), 1_000, other, -SCORE_SCALE, 1, 0)
            .unwrap();
    }

    #[test]
    fn test_circuit_breaker_disabled() {
        let mut oracle = create_oracle();
        oracle.set_circuit_breaker(owner(), false).unwrap();
        oracle
            .update_sentiment(owner(), 0, asset(), SCORE_SCALE, 1, 0)
            .unwrap();
        oracle
            .update_sentiment(owner(), 1_000, asset(), -SCORE_SCALE, 1, 0)
            .unwrap();
    }

    #[test]
    fn test_circuit_breaker_event_in_batch() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 1_000, asset(), 500_000_000_000_000_000, 1, 50)
            .unwrap();

        let (applied, events) = oracle
            .batch_update_sentiment(
                owner(),
                2_000,
                &[asset()],
                &[100_000_000_000_000_000],
                &[1],
                &[50],
            )
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(
            events,
            vec![OracleEvent::CircuitBreakerTriggered {
                asset: asset(),
                reason_code: REASON_SCORE_JUMP,
            }]
        );
    }

    #[test]
    fn test_batch_cap() {
        let mut oracle = create_oracle();
        let make = |n: usize| {
            let assets: Vec<Address> = (0..n)
                .map(|i| Address::from_low_u64_be(i as u64 + 1))
                .collect();
            (assets, vec![0i128; n], vec![1u32; n], vec![0u16; n])
        };

        let (assets, scores, sizes, confs) = make(BATCH_CAP);
        let (applied, _) = oracle
            .batch_update_sentiment(owner(), 0, &assets, &scores, &sizes, &confs)
            .unwrap();
        assert_eq!(applied, 50);

        let (assets, scores, sizes, confs) = make(BATCH_CAP + 1);
        let result = oracle.batch_update_sentiment(owner(), 1_000, &assets, &scores, &sizes, &confs);
        assert_eq!(result.unwrap_err(), ContractError::BatchTooLarge);
    }

    #[test]
    fn test_batch_length_mismatch() {
        let mut oracle = create_oracle();
        let result =
            oracle.batch_update_sentiment(owner(), 0, &[asset()], &[0, 1], &[1], &[0]);
        assert_eq!(result.unwrap_err(), ContractError::LengthMismatch);
    }

    #[test]
    fn test_batch_zero_asset_skipped() {
        let mut oracle = create_oracle();
        let (applied, _) = oracle
            .batch_update_sentiment(
                owner(),
                0,
                &[Address::zero(), asset()],
                &[0, 42],
                &[1, 1],
                &[0, 0],
            )
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(oracle.get_sentiment(asset()).unwrap().score_fp, 42);
    }

    #[test]
    fn test_history_ring_never_exceeds_capacity() {
        let mut config = OracleContractConfig::default();
        config.min_update_interval = 0;
        config.circuit_breaker_enabled = false;
        let mut oracle = SentimentOracle::new(owner(), config);

        for i in 0..(HISTORY_CAPACITY as u64 + 100) {
            oracle
                .update_sentiment(owner(), i, asset(), i as i128, 1, 0)
                .unwrap();
        }

        let history = oracle.get_history(asset(), usize::MAX);
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Newest first; oldest entries were overwritten.
        assert_eq!(history[0].timestamp, HISTORY_CAPACITY as u64 + 99);
        assert_eq!(history.last().unwrap().timestamp, 100);
    }

    #[test]
    fn test_history_newest_first() {
        let mut oracle = create_oracle();
        oracle
            .update_sentiment(owner(), 1_000, asset(), 10, 1, 0)
            .unwrap();
        oracle
            .update_sentiment(owner(), 1_240, asset(), 20, 1, 0)
            .unwrap();

        let history = oracle.get_history(asset(), 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].score_fp, 20);
        assert_eq!(history[1].score_fp, 10);
    }

    #[test]
    fn test_last_update_non_decreasing() {
        let mut config = OracleContractConfig::default();
        config.min_update_interval = 0;
        config.circuit_breaker_enabled = false;
        let mut oracle = SentimentOracle::new(owner(), config);

        let mut last = 0;
        for now in [100u64, 400, 400, 900, 2_000] {
            oracle
                .update_sentiment(owner(), now, asset(), 0, 1, 0)
                .unwrap();
            let ts = oracle.get_sentiment(asset()).unwrap().timestamp;
            assert!(ts >= last);
            last = ts;
        }
    }

    #[test]
    fn test_staleness() {
        let mut oracle = create_oracle();
        assert!(oracle.is_stale(asset(), 600, 1_000));
        oracle
            .update_sentiment(owner(), 1_000, asset(), 0, 1, 0)
            .unwrap();
        assert!(!oracle.is_stale(asset(), 600, 1_500));
        assert!(oracle.is_stale(asset(), 600, 1_700));
    }

    #[test]
    fn test_pause_blocks_writes() {
        let mut oracle = create_oracle();
        oracle.set_paused(owner(), true).unwrap();
        let result = oracle.update_sentiment(owner(), 0, asset(), 0, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::Paused);

        oracle.set_paused(owner(), false).unwrap();
        oracle.update_sentiment(owner(), 0, asset(), 0, 1, 0).unwrap();
    }

    #[test]
    fn test_operator_grant_and_revoke() {
        let mut oracle = create_oracle();
        let operator = Address::repeat_byte(0x42);

        oracle.grant_operator(owner(), operator).unwrap();
        oracle
            .update_sentiment(operator, 0, asset(), 0, 1, 0)
            .unwrap();

        oracle.revoke_operator(owner(), operator).unwrap();
        let result = oracle.update_sentiment(operator, 1_000, asset(), 0, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::NotOperator);

        // Admin calls require the owner.
        assert_eq!(
            oracle.grant_operator(operator, operator).unwrap_err(),
            ContractError::NotOwner
        );
    }

    #[test]
    fn test_whitelist_enforcement() {
        let mut oracle = create_oracle();
        oracle.set_whitelist_enabled(owner(), true).unwrap();

        let result = oracle.update_sentiment(owner(), 0, asset(), 0, 1, 0);
        assert_eq!(result.unwrap_err(), ContractError::NotWhitelisted);

        let event = oracle.set_whitelisted(owner(), asset(), true).unwrap();
        assert_eq!(
            event,
            OracleEvent::TokenWhitelisted {
                asset: asset(),
                status: true,
            }
        );
        oracle.update_sentiment(owner(), 0, asset(), 0, 1, 0).unwrap();
    }
}
