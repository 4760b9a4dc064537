//! On-chain submission: batching, nonce and gas management, signing,
//! broadcast and confirmation tracking.
//!
//! The submitter mirrors the contract's MIN_UPDATE_INTERVAL and
//! MAX_SCORE_CHANGE rules locally so guaranteed reverts never cost gas,
//! serializes nonce allocation and signing per signer address, and
//! replaces dropped transactions at the same nonce with bumped gas.

use crate::chain::abi;
use crate::chain::rpc::{BlockTag, CallRequest, EthRpc, RpcError};
use crate::chain::signer::{apply_eip155, TxSigner};
use crate::config::ChainConfig;
use crate::metrics::PipelineMetrics;
use crate::storage::OracleStore;
use crate::types::{AssetSample, OracleEntry, SubmissionJob};
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, TransactionRequest, H256, U256};
use ethers_core::utils::keccak256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Gas-price bump applied on UNDERPRICED and on dropped-transaction
/// replacement: +10%.
const GAS_BUMP_NUMERATOR: u64 = 110;
const GAS_BUMP_DENOMINATOR: u64 = 100;

/// Broadcast attempts per chunk before giving up on the RPC.
const MAX_SEND_ATTEMPTS: u32 = 8;

#[derive(Debug, Error)]
pub enum SubmitError {
    /// The RPC stayed unreachable past the cycle deadline
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),
    /// Cycle-level fatal; the next cycle retries
    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),
}

/// Per-transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    PendingSign,
    PendingBroadcast,
    PendingConfirm,
    Confirmed,
    Reverted,
    Dropped,
}

impl TxState {
    fn as_str(&self) -> &'static str {
        match self {
            TxState::PendingSign => "pending_sign",
            TxState::PendingBroadcast => "pending_broadcast",
            TxState::PendingConfirm => "pending_confirm",
            TxState::Confirmed => "confirmed",
            TxState::Reverted => "reverted",
            TxState::Dropped => "dropped",
        }
    }
}

/// What one submission call accomplished.
#[derive(Debug, Default)]
pub struct SubmitOutcome {
    pub confirmed: Vec<H256>,
    pub reverted: Vec<H256>,
    /// Broadcast but unconfirmed at the deadline; reconciled next cycle
    pub pending: Vec<H256>,
    pub skipped_min_interval: usize,
    pub skipped_circuit_breaker: usize,
}

impl SubmitOutcome {
    /// True when nothing is left awaiting confirmation.
    pub fn settled(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn broadcast_count(&self) -> usize {
        self.confirmed.len() + self.reverted.len() + self.pending.len()
    }
}

/// Submission knobs, mirroring the chain section of the node config.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub contract: Address,
    pub chain_id: u64,
    pub batch_size: usize,
    pub min_update_interval: u64,
    pub max_score_change: i128,
    pub confirmations: u64,
    pub gas_multiplier: f64,
    pub gas_ceiling: U256,
    pub receipt_poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl SubmitterConfig {
    pub fn from_chain_config(chain: &ChainConfig, contract: Address) -> Self {
        Self {
            contract,
            chain_id: chain.chain_id,
            batch_size: chain.batch_size,
            min_update_interval: chain.min_update_interval_s,
            max_score_change: chain.max_score_change_fp,
            confirmations: chain.confirmations,
            gas_multiplier: chain.gas_multiplier,
            gas_ceiling: chain.gas_ceiling_u256(),
            receipt_poll_interval: Duration::from_secs(chain.receipt_poll_interval_s),
            stall_timeout: Duration::from_secs(chain.stall_timeout_s),
        }
    }
}

/// Serialized nonce state; `None` forces a resync from the chain.
struct NonceState {
    next: Option<u64>,
}

struct InFlight {
    tx: TypedTransaction,
    hash: H256,
    nonce: u64,
    gas_price: U256,
    broadcast_at: Instant,
    state: TxState,
    samples: Vec<AssetSample>,
}

/// The submission engine. One instance per signer address.
pub struct Submitter {
    rpc: Arc<dyn EthRpc>,
    signer: Arc<dyn TxSigner>,
    config: SubmitterConfig,
    nonce: Mutex<NonceState>,
    /// Local mirror of the contract's last accepted entry per asset
    last_accepted: Mutex<HashMap<Address, OracleEntry>>,
    store: Option<Arc<OracleStore>>,
    metrics: Arc<PipelineMetrics>,
}

impl Submitter {
    pub fn new(
        rpc: Arc<dyn EthRpc>,
        signer: Arc<dyn TxSigner>,
        config: SubmitterConfig,
        store: Option<Arc<OracleStore>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            rpc,
            signer,
            config,
            nonce: Mutex::new(NonceState { next: None }),
            last_accepted: Mutex::new(HashMap::new()),
            store,
            metrics,
        }
    }

    /// Submit one job: filter, batch, sign, broadcast and confirm until
    /// the deadline.
    #[instrument(skip(self, job), fields(samples = job.samples.len()))]
    pub async fn submit(
        &self,
        job: &SubmissionJob,
        now_ts: u64,
        deadline: Instant,
    ) -> Result<SubmitOutcome, SubmitError> {
        let mut outcome = SubmitOutcome::default();
        let eligible = self.filter_eligible(job, now_ts, &mut outcome).await;
        if eligible.is_empty() {
            debug!("no samples eligible for submission");
            return Ok(outcome);
        }

        let mut in_flight = Vec::new();
        for chunk in eligible.chunks(self.config.batch_size) {
            match self.broadcast_chunk(chunk, deadline).await? {
                Some(entry) => in_flight.push(entry),
                None => {}
            }
        }

        self.await_confirmations(&mut in_flight, now_ts, deadline, &mut outcome)
            .await;
        Ok(outcome)
    }

    /// Resynchronize nonce state and settle any transactions persisted as
    /// pending by a previous run. Called at startup and after timed-out
    /// cycles.
    pub async fn reconcile(&self, now_ts: i64) -> Result<(), SubmitError> {
        {
            let mut nonce = self.nonce.lock().await;
            let next = self.fetch_pending_nonce().await?;
            nonce.next = Some(next);
            PipelineMetrics::inc(&self.metrics.nonce_resyncs);
            debug!("nonce resynchronized to {}", next);
        }

        let Some(store) = &self.store else {
            return Ok(());
        };
        let pending = match store.pending_txs().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("failed to load pending transactions: {}", e);
                return Ok(());
            }
        };
        for record in pending {
            let Ok(hash) = record.tx_hash.parse::<H256>() else {
                continue;
            };
            let state = match self.rpc.transaction_receipt(hash).await {
                Ok(Some(receipt)) if receipt.status == Some(1u64.into()) => TxState::Confirmed,
                Ok(Some(_)) => TxState::Reverted,
                // The nonce was resynced above; an unmined leftover will
                // never land now.
                Ok(None) => TxState::Dropped,
                Err(e) => {
                    warn!("receipt lookup failed during reconcile: {}", e);
                    continue;
                }
            };
            info!(
                "reconciled transaction {} at nonce {} as {}",
                record.tx_hash,
                record.nonce,
                state.as_str()
            );
            if let Err(e) = store
                .record_tx(&record.tx_hash, record.nonce as u64, state.as_str(), now_ts)
                .await
            {
                warn!("failed to persist reconciled status: {}", e);
            }
        }
        Ok(())
    }

    /// Drop samples the contract is guaranteed to reject: still inside the
    /// update interval, or tripping the circuit breaker.
    async fn filter_eligible(
        &self,
        job: &SubmissionJob,
        now_ts: u64,
        outcome: &mut SubmitOutcome,
    ) -> Vec<AssetSample> {
        let mut eligible = Vec::new();
        for sample in job.samples.iter() {
            match self.last_known(sample.asset).await {
                Some(previous) => {
                    if now_ts < previous.timestamp + self.config.min_update_interval {
                        PipelineMetrics::inc(&self.metrics.submit_skipped_min_interval);
                        outcome.skipped_min_interval += 1;
                        debug!(
                            symbol = %sample.symbol,
                            "skipped: {}s since last accepted update",
                            now_ts.saturating_sub(previous.timestamp)
                        );
                        continue;
                    }
                    let change = sample
                        .score_fp
                        .checked_sub(previous.score_fp)
                        .map(i128::abs)
                        .unwrap_or(i128::MAX);
                    if previous.score_fp != 0 && change > self.config.max_score_change {
                        PipelineMetrics::inc(&self.metrics.submit_skipped_circuit_breaker);
                        outcome.skipped_circuit_breaker += 1;
                        warn!(
                            symbol = %sample.symbol,
                            change,
                            "skipped: score change would trip the circuit breaker"
                        );
                        continue;
                    }
                }
                None => {}
            }
            eligible.push(sample.clone());
        }
        eligible
    }

    /// Last accepted on-chain entry for `asset`, from the local mirror or
    /// a contract read. Returns `None` for never-updated assets.
    async fn last_known(&self, asset: Address) -> Option<OracleEntry> {
        if let Some(entry) = self.last_accepted.lock().await.get(&asset) {
            return Some(*entry);
        }
        let call = CallRequest {
            from: None,
            to: self.config.contract,
            data: Some(abi::encode_get(asset)),
        };
        match self.rpc.call(&call, BlockTag::Latest).await {
            Ok(data) => match abi::decode_entry(&data) {
                Ok(entry) if entry.timestamp > 0 => {
                    self.last_accepted.lock().await.insert(asset, entry);
                    Some(entry)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("could not decode latest entry for {:?}: {}", asset, e);
                    None
                }
            },
            Err(e) => {
                // The contract still enforces its rules; proceed.
                warn!("latest-entry read failed for {:?}: {}", asset, e);
                PipelineMetrics::inc(&self.metrics.rpc_errors);
                None
            }
        }
    }

    fn calldata_for(&self, chunk: &[AssetSample]) -> ethers_core::types::Bytes {
        if chunk.len() == 1 {
            let sample = &chunk[0];
            abi::encode_update(
                sample.asset,
                sample.score_fp,
                sample.sample_size,
                sample.confidence_bp,
            )
        } else {
            let elements: Vec<(Address, i128, u32, u16)> = chunk
                .iter()
                .map(|s| (s.asset, s.score_fp, s.sample_size, s.confidence_bp))
                .collect();
            abi::encode_batch_update(&elements)
        }
    }

    /// Sign and broadcast one chunk. Returns `None` when the chunk is
    /// abandoned (estimate-time revert), `Some` once a transaction is in
    /// flight.
    async fn broadcast_chunk(
        &self,
        chunk: &[AssetSample],
        deadline: Instant,
    ) -> Result<Option<InFlight>, SubmitError> {
        let data = self.calldata_for(chunk);
        let call = CallRequest {
            from: Some(self.signer.address()),
            to: self.config.contract,
            data: Some(data.clone()),
        };

        let estimate = match self.with_rpc_retry(deadline, || self.rpc.estimate_gas(&call)).await {
            Ok(estimate) => estimate,
            Err(RpcError::Rpc { message, .. }) => {
                // The node simulated a revert; the pre-checks missed a
                // contract-side rule. Drop the chunk, nothing was broadcast.
                warn!("gas estimate reverted, abandoning chunk: {}", message);
                PipelineMetrics::inc(&self.metrics.tx_reverted);
                return Ok(None);
            }
            Err(e) => return Err(SubmitError::RpcUnavailable(e.to_string())),
        };
        let gas_limit = mul_gas(estimate, self.config.gas_multiplier).min(self.config.gas_ceiling);

        let mut gas_price = match self.with_rpc_retry(deadline, || self.rpc.gas_price()).await {
            Ok(price) => price,
            Err(e) => return Err(SubmitError::RpcUnavailable(e.to_string())),
        };

        // Nonce allocation, signing and broadcast run under the nonce lock:
        // no two in-flight transactions may share a nonce, and the signer
        // accepts one call at a time per address.
        let mut nonce_state = self.nonce.lock().await;
        let mut nonce = match nonce_state.next {
            Some(nonce) => nonce,
            None => {
                let synced = self.fetch_pending_nonce().await?;
                PipelineMetrics::inc(&self.metrics.nonce_resyncs);
                nonce_state.next = Some(synced);
                synced
            }
        };

        for attempt in 0..MAX_SEND_ATTEMPTS {
            if Instant::now() >= deadline {
                return Err(SubmitError::RpcUnavailable(
                    "deadline reached before broadcast".to_string(),
                ));
            }
            let (tx, raw, hash) = self.sign_tx(nonce, gas_limit, gas_price, &data).await?;

            match self.rpc.send_raw_transaction(raw).await {
                Ok(sent_hash) => {
                    nonce_state.next = Some(nonce + 1);
                    drop(nonce_state);
                    PipelineMetrics::inc(&self.metrics.tx_broadcast);
                    self.persist_tx(sent_hash, nonce, TxState::PendingConfirm).await;
                    info!(
                        "broadcast {:?} at nonce {} covering {} samples",
                        sent_hash,
                        nonce,
                        chunk.len()
                    );
                    return Ok(Some(InFlight {
                        tx,
                        hash: sent_hash,
                        nonce,
                        gas_price,
                        broadcast_at: Instant::now(),
                        state: TxState::PendingConfirm,
                        samples: chunk.to_vec(),
                    }));
                }
                Err(e) if e.is_already_known() => {
                    nonce_state.next = Some(nonce + 1);
                    drop(nonce_state);
                    PipelineMetrics::inc(&self.metrics.tx_broadcast);
                    self.persist_tx(hash, nonce, TxState::PendingConfirm).await;
                    return Ok(Some(InFlight {
                        tx,
                        hash,
                        nonce,
                        gas_price,
                        broadcast_at: Instant::now(),
                        state: TxState::PendingConfirm,
                        samples: chunk.to_vec(),
                    }));
                }
                Err(e) if e.is_underpriced() => {
                    gas_price = bump_gas_price(gas_price);
                    debug!(
                        "underpriced at nonce {}, bumping gas price to {} (attempt {})",
                        nonce, gas_price, attempt
                    );
                }
                Err(e) if e.is_nonce_too_low() => {
                    let next = self.fetch_pending_nonce().await?;
                    PipelineMetrics::inc(&self.metrics.nonce_resyncs);
                    warn!("nonce gap detected, resynchronized to {}", next);
                    nonce_state.next = Some(next);
                    nonce = next;
                }
                Err(RpcError::Rpc { code, message }) => {
                    warn!("broadcast rejected ({}): {}", code, message);
                    PipelineMetrics::inc(&self.metrics.tx_reverted);
                    return Ok(None);
                }
                Err(e) => {
                    PipelineMetrics::inc(&self.metrics.rpc_errors);
                    debug!("broadcast transport error, backing off: {}", e);
                    let pause = Duration::from_millis(500 * (1 << attempt.min(5)));
                    if Instant::now() + pause >= deadline {
                        return Err(SubmitError::RpcUnavailable(e.to_string()));
                    }
                    tokio::time::sleep(pause).await;
                }
            }
        }
        Err(SubmitError::RpcUnavailable(
            "broadcast attempts exhausted".to_string(),
        ))
    }

    async fn sign_tx(
        &self,
        nonce: u64,
        gas_limit: U256,
        gas_price: U256,
        data: &ethers_core::types::Bytes,
    ) -> Result<(TypedTransaction, ethers_core::types::Bytes, H256), SubmitError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.signer.address())
            .to(self.config.contract)
            .gas(gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(self.config.chain_id)
            .data(data.clone())
            .into();

        let digest = tx.sighash();
        let signature = match self.signer.sign_digest(digest).await {
            Ok(signature) => signature,
            Err(e) => {
                PipelineMetrics::inc(&self.metrics.signer_errors);
                return Err(SubmitError::SignerUnavailable(e.to_string()));
            }
        };
        let signature = apply_eip155(signature, self.config.chain_id);
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(raw.as_ref()));
        Ok((tx, raw, hash))
    }

    /// Poll receipts until everything settles or the deadline arrives.
    /// Dropped transactions are replaced at the same nonce with bumped gas.
    async fn await_confirmations(
        &self,
        in_flight: &mut Vec<InFlight>,
        now_ts: u64,
        deadline: Instant,
        outcome: &mut SubmitOutcome,
    ) {
        while in_flight.iter().any(|t| t.state == TxState::PendingConfirm)
            && Instant::now() < deadline
        {
            let head = match self.rpc.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    PipelineMetrics::inc(&self.metrics.rpc_errors);
                    debug!("block number poll failed: {}", e);
                    if self.sleep_until_poll(deadline).await {
                        continue;
                    }
                    break;
                }
            };

            for entry in in_flight.iter_mut() {
                if entry.state != TxState::PendingConfirm {
                    continue;
                }
                match self.rpc.transaction_receipt(entry.hash).await {
                    Ok(Some(receipt)) => {
                        if receipt.status == Some(1u64.into()) {
                            let mined_at =
                                receipt.block_number.map(|b| b.as_u64()).unwrap_or(head);
                            let confirmations = head.saturating_sub(mined_at) + 1;
                            if confirmations >= self.config.confirmations {
                                entry.state = TxState::Confirmed;
                                PipelineMetrics::inc(&self.metrics.tx_confirmed);
                                self.persist_tx(entry.hash, entry.nonce, TxState::Confirmed)
                                    .await;
                                self.remember_accepted(&entry.samples, now_ts).await;
                                info!(
                                    "confirmed {:?} at nonce {} ({} confirmations)",
                                    entry.hash, entry.nonce, confirmations
                                );
                            }
                        } else {
                            entry.state = TxState::Reverted;
                            PipelineMetrics::inc(&self.metrics.tx_reverted);
                            self.persist_tx(entry.hash, entry.nonce, TxState::Reverted).await;
                            warn!("transaction {:?} at nonce {} reverted", entry.hash, entry.nonce);
                        }
                    }
                    Ok(None) => {
                        if entry.broadcast_at.elapsed() >= self.config.stall_timeout {
                            self.replace_dropped(entry).await;
                        }
                    }
                    Err(e) => {
                        PipelineMetrics::inc(&self.metrics.rpc_errors);
                        debug!("receipt poll failed for {:?}: {}", entry.hash, e);
                    }
                }
            }

            if in_flight.iter().all(|t| t.state != TxState::PendingConfirm) {
                break;
            }
            if !self.sleep_until_poll(deadline).await {
                break;
            }
        }

        for entry in in_flight.iter() {
            match entry.state {
                TxState::Confirmed => outcome.confirmed.push(entry.hash),
                TxState::Reverted => outcome.reverted.push(entry.hash),
                _ => outcome.pending.push(entry.hash),
            }
        }
    }

    /// Replace a stalled transaction: same nonce, same payload, gas price
    /// bumped 10%.
    async fn replace_dropped(&self, entry: &mut InFlight) {
        PipelineMetrics::inc(&self.metrics.tx_dropped_replaced);
        self.persist_tx(entry.hash, entry.nonce, TxState::Dropped).await;

        let bumped = bump_gas_price(entry.gas_price);
        let mut tx = entry.tx.clone();
        tx.set_gas_price(bumped);

        // The nonce is reused, but the lock still serializes the signer.
        let _nonce_state = self.nonce.lock().await;
        let digest = tx.sighash();
        let signature = match self.signer.sign_digest(digest).await {
            Ok(signature) => apply_eip155(signature, self.config.chain_id),
            Err(e) => {
                PipelineMetrics::inc(&self.metrics.signer_errors);
                warn!("could not re-sign replacement transaction: {}", e);
                return;
            }
        };
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(raw.as_ref()));

        match self.rpc.send_raw_transaction(raw).await {
            Ok(sent_hash) => {
                warn!(
                    "replaced dropped {:?} at nonce {} with {:?} (gas price {})",
                    entry.hash, entry.nonce, sent_hash, bumped
                );
                entry.tx = tx;
                entry.hash = sent_hash;
                entry.gas_price = bumped;
                entry.broadcast_at = Instant::now();
                self.persist_tx(sent_hash, entry.nonce, TxState::PendingConfirm).await;
            }
            Err(e) if e.is_already_known() => {
                entry.tx = tx;
                entry.hash = hash;
                entry.gas_price = bumped;
                entry.broadcast_at = Instant::now();
            }
            Err(e) => {
                PipelineMetrics::inc(&self.metrics.rpc_errors);
                warn!("replacement broadcast failed: {}", e);
            }
        }
    }

    async fn remember_accepted(&self, samples: &[AssetSample], now_ts: u64) {
        let mut last = self.last_accepted.lock().await;
        for sample in samples {
            last.insert(
                sample.asset,
                OracleEntry {
                    score_fp: sample.score_fp,
                    timestamp: now_ts,
                    sample_size: sample.sample_size,
                    confidence_bp: sample.confidence_bp,
                },
            );
        }
    }

    async fn persist_tx(&self, hash: H256, nonce: u64, state: TxState) {
        if let Some(store) = &self.store {
            let ts = chrono::Utc::now().timestamp();
            if let Err(e) = store
                .record_tx(&format!("{:#x}", hash), nonce, state.as_str(), ts)
                .await
            {
                warn!("failed to persist transaction state: {}", e);
            }
        }
    }

    async fn fetch_pending_nonce(&self) -> Result<u64, SubmitError> {
        self.rpc
            .transaction_count(self.signer.address(), BlockTag::Pending)
            .await
            .map_err(|e| SubmitError::RpcUnavailable(e.to_string()))
    }

    /// Sleep one poll interval, clamped to the deadline. Returns false when
    /// the deadline arrived.
    async fn sleep_until_poll(&self, deadline: Instant) -> bool {
        let wake = Instant::now() + self.config.receipt_poll_interval;
        if wake >= deadline {
            tokio::time::sleep_until(deadline).await;
            return false;
        }
        tokio::time::sleep_until(wake).await;
        true
    }

    /// Retry transient RPC failures with backoff until the deadline.
    /// JSON-RPC errors are returned immediately.
    async fn with_rpc_retry<T, F, Fut>(&self, deadline: Instant, mut call: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e @ RpcError::Rpc { .. }) => return Err(e),
                Err(e) => {
                    PipelineMetrics::inc(&self.metrics.rpc_errors);
                    let pause = Duration::from_millis(500 * (1 << attempt.min(5)));
                    if Instant::now() + pause >= deadline {
                        return Err(e);
                    }
                    debug!("rpc retry in {:?} after: {}", pause, e);
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn mul_gas(value: U256, multiplier: f64) -> U256 {
    let scaled = (value.as_u128() as f64 * multiplier).ceil() as u128;
    U256::from(scaled)
}

fn bump_gas_price(price: U256) -> U256 {
    price * U256::from(GAS_BUMP_NUMERATOR) / U256::from(GAS_BUMP_DENOMINATOR)
}
