//! Per-cohort cycle driver.
//!
//! One orchestrator task per cohort: every period it fans out to the
//! collectors, funnels items through dedup, the scoring pool and the
//! aggregator, screens each sample for manipulation and hands the
//! survivors to the submitter as a single job. Late cycles are never
//! queued; missed ticks coalesce and the next cycle starts at the next
//! period boundary.

use crate::config::{CohortConfig, CycleConfig};
use crate::metrics::PipelineMetrics;
use crate::pipeline::aggregator::Aggregator;
use crate::pipeline::collectors::{
    collect_with_retry, CollectWindow, Collector, CycleContext,
};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::manipulation::ManipulationDetector;
use crate::pipeline::scorer::EnsembleScorer;
use crate::chain::submitter::{SubmitError, Submitter};
use crate::types::{AssetSample, Item, ScoredItem, SubmissionJob};
use ethers_core::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// What one cycle accomplished; returned for logs and tests.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub collected: usize,
    pub deduplicated: usize,
    pub scored: usize,
    pub samples_emitted: usize,
    pub samples_vetoed: usize,
    pub broadcast: usize,
    pub confirmed: usize,
    pub timed_out: bool,
}

/// Drives collection -> scoring -> manipulation check -> submission for
/// one cohort.
pub struct Orchestrator {
    cohort: CohortConfig,
    cycle_config: CycleConfig,
    collectors: Vec<Arc<dyn Collector>>,
    dedup: Arc<Deduplicator>,
    scorer: Arc<EnsembleScorer>,
    aggregator: Aggregator,
    detector: ManipulationDetector,
    submitter: Arc<Submitter>,
    /// Symbol -> on-chain asset address
    registry: HashMap<String, Address>,
    metrics: Arc<PipelineMetrics>,
    cycle_counter: u64,
    /// Set when a cycle left transactions unsettled; the next cycle
    /// resynchronizes the submitter before doing anything else
    needs_reconcile: bool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cohort: CohortConfig,
        cycle_config: CycleConfig,
        collectors: Vec<Arc<dyn Collector>>,
        dedup: Arc<Deduplicator>,
        scorer: Arc<EnsembleScorer>,
        detector: ManipulationDetector,
        submitter: Arc<Submitter>,
        registry: HashMap<String, Address>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cohort,
            cycle_config,
            collectors,
            dedup,
            scorer,
            aggregator: Aggregator::new(),
            detector,
            submitter,
            registry,
            metrics,
            cycle_counter: 0,
            needs_reconcile: false,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.cohort.period_s.unwrap_or(self.cycle_config.period_s))
    }

    /// Main loop: one cycle per period until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.period();
        let mut ticker = tokio::time::interval(period);
        // Never queue late cycles; coalesce onto the next boundary.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            cohort = %self.cohort.name,
            period_s = period.as_secs(),
            "orchestrator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ts = chrono::Utc::now().timestamp();
                    let report = self.run_cycle(now_ts).await;
                    debug!(cohort = %self.cohort.name, ?report, "cycle finished");
                    self.metrics.log_summary(&self.cohort.name);
                    if let Err(e) = self.dedup.prune_journal(now_ts).await {
                        warn!("dedup journal prune failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(cohort = %self.cohort.name, "orchestrator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one full cycle against the window ending at `now_ts`.
    #[instrument(skip(self), fields(cohort = %self.cohort.name))]
    pub async fn run_cycle(&mut self, now_ts: i64) -> CycleReport {
        PipelineMetrics::inc(&self.metrics.cycles_started);
        self.cycle_counter += 1;
        let period = self.period();
        let deadline =
            Instant::now() + period - Duration::from_secs(self.cycle_config.jitter_s);
        let ctx = CycleContext {
            cycle_id: self.cycle_counter,
            deadline,
        };
        let window = CollectWindow {
            start_ts: now_ts - period.as_secs() as i64,
            end_ts: now_ts,
        };
        let mut report = CycleReport::default();

        // A previous cycle left transactions in flight; settle them first.
        if self.needs_reconcile {
            match self.submitter.reconcile(now_ts).await {
                Ok(()) => self.needs_reconcile = false,
                Err(e) => warn!("submitter reconciliation failed: {}", e),
            }
        }

        // Stage 1: fan out to all collectors in parallel.
        let items = self.collect_all(&ctx, window).await;
        report.collected = items.len();
        PipelineMetrics::add(&self.metrics.items_collected, items.len() as u64);

        // Stage 2: drop duplicates within the horizon.
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if self.dedup.check_and_insert(&item.id, now_ts).await {
                fresh.push(item);
            } else {
                PipelineMetrics::inc(&self.metrics.items_deduplicated);
            }
        }
        report.deduplicated = fresh.len();

        // Stage 3: score in parallel, dropping whatever is unscored at the
        // deadline.
        let scored = self.score_all(fresh, deadline).await;
        report.scored = scored.len();
        PipelineMetrics::add(&self.metrics.items_scored, scored.len() as u64);

        // Stages 4-5: aggregate per asset and screen for manipulation.
        let survivors = self.aggregate_and_screen(&scored, now_ts as u64, &mut report);

        // Stage 6: one submission job for everything that survived.
        match SubmissionJob::assemble(survivors, now_ts as u64) {
            Some(job) => match self.submitter.submit(&job, now_ts as u64, deadline).await {
                Ok(outcome) => {
                    report.broadcast = outcome.broadcast_count();
                    report.confirmed = outcome.confirmed.len();
                    if outcome.settled() {
                        PipelineMetrics::inc(&self.metrics.cycles_completed);
                    } else {
                        report.timed_out = true;
                        self.needs_reconcile = true;
                        PipelineMetrics::inc(&self.metrics.cycles_timeout);
                        warn!(
                            cohort = %self.cohort.name,
                            pending = outcome.pending.len(),
                            "cycle deadline reached before confirmation"
                        );
                    }
                }
                Err(SubmitError::RpcUnavailable(e)) => {
                    report.timed_out = true;
                    self.needs_reconcile = true;
                    PipelineMetrics::inc(&self.metrics.cycles_timeout);
                    error!(cohort = %self.cohort.name, "submission failed: {}", e);
                }
                Err(SubmitError::SignerUnavailable(e)) => {
                    // Cycle-level fatal; the next cycle retries.
                    report.timed_out = true;
                    PipelineMetrics::inc(&self.metrics.cycles_timeout);
                    error!(cohort = %self.cohort.name, "signer unavailable: {}", e);
                }
            },
            None => {
                PipelineMetrics::inc(&self.metrics.cycles_completed);
                debug!(cohort = %self.cohort.name, "nothing to submit this cycle");
            }
        }
        report
    }

    /// Fan out to every collector; sources that fail terminally are
    /// skipped for the cycle.
    async fn collect_all(&self, ctx: &CycleContext, window: CollectWindow) -> Vec<Item> {
        let assets = self.cohort.assets.clone();
        let mut join_set = JoinSet::new();
        for collector in &self.collectors {
            let collector = collector.clone();
            let metrics = self.metrics.clone();
            let assets = assets.clone();
            let ctx = *ctx;
            join_set.spawn(async move {
                collect_with_retry(collector.as_ref(), &ctx, window, &assets, &metrics).await
            });
        }

        let mut items = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(batch)) => items.extend(batch.items),
                // Errors were already counted and logged by the retry
                // wrapper.
                Ok(Err(_)) => {}
                Err(e) => warn!("collector task panicked: {}", e),
            }
        }
        items
    }

    /// Bounded scoring pool between dedup and aggregation.
    async fn score_all(&self, items: Vec<Item>, deadline: Instant) -> Vec<ScoredItem> {
        if items.is_empty() {
            return Vec::new();
        }
        let depth = self.cycle_config.stage_queue_depth;
        let workers = match self.cycle_config.scorer_parallelism {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(8),
            n => n,
        };

        let (item_tx, item_rx) = mpsc::channel::<Item>(depth);
        let (scored_tx, mut scored_rx) = mpsc::channel::<ScoredItem>(depth);
        let item_rx = Arc::new(Mutex::new(item_rx));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let item_rx = item_rx.clone();
            let scored_tx = scored_tx.clone();
            let scorer = self.scorer.clone();
            pool.spawn(async move {
                loop {
                    let item = { item_rx.lock().await.recv().await };
                    let Some(item) = item else { break };
                    let scored = scorer.score(&item.text).await;
                    let out = ScoredItem {
                        item,
                        polarity: scored.polarity,
                        confidence: scored.confidence,
                        degraded: scored.degraded,
                    };
                    if scored_tx.send(out).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(scored_tx);

        let expected = items.len();
        let feeder = tokio::spawn(async move {
            for item in items {
                if item_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let mut scored = Vec::with_capacity(expected);
        loop {
            match tokio::time::timeout_at(deadline, scored_rx.recv()).await {
                Ok(Some(item)) => scored.push(item),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "scoring deadline reached, proceeding with {}/{} items",
                        scored.len(),
                        expected
                    );
                    break;
                }
            }
        }
        // Stop the pool; workers drain and exit once the channels close.
        scored_rx.close();
        pool.abort_all();
        feeder.abort();
        scored
    }

    /// Aggregate per asset, screen each sample, keep the survivors.
    fn aggregate_and_screen(
        &mut self,
        scored: &[ScoredItem],
        window_end_ts: u64,
        report: &mut CycleReport,
    ) -> Vec<AssetSample> {
        let mut per_asset: HashMap<&str, Vec<ScoredItem>> = HashMap::new();
        for item in scored {
            for tag in &item.item.asset_tags {
                if self.cohort.assets.iter().any(|symbol| symbol == tag) {
                    per_asset.entry(tag.as_str()).or_default().push(item.clone());
                }
            }
        }

        let mut survivors = Vec::new();
        for (symbol, items) in per_asset {
            let Some(address) = self.registry.get(symbol) else {
                warn!("no address registered for symbol {}", symbol);
                continue;
            };
            let Some(mut sample) =
                self.aggregator
                    .aggregate(*address, symbol, &items, window_end_ts)
            else {
                PipelineMetrics::inc(&self.metrics.aggregates_empty);
                continue;
            };
            PipelineMetrics::inc(&self.metrics.samples_emitted);
            report.samples_emitted += 1;

            let verdict = self.detector.evaluate(&items, &sample);
            sample.manipulation_score = verdict.score;
            if verdict.vetoed {
                PipelineMetrics::inc(&self.metrics.samples_vetoed);
                report.samples_vetoed += 1;
                continue;
            }
            survivors.push(sample);
        }
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::contract::{OracleContractConfig, SentimentOracle};
    use crate::chain::signer::{LocalSigner, TxSigner};
    use crate::chain::sim_rpc::SimRpc;
    use crate::chain::submitter::SubmitterConfig;
    use crate::config::{CohortConfig, CycleConfig, ManipulationConfig};
    use crate::pipeline::collectors::SimCollector;

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn contract_address() -> Address {
        Address::repeat_byte(0xcc)
    }

    fn asset_address() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn build_orchestrator(sim: Arc<SimRpc>) -> Orchestrator {
        let metrics = Arc::new(PipelineMetrics::new());
        let signer = Arc::new(LocalSigner::from_hex_key(TEST_KEY).unwrap());

        let mut chain = crate::config::ChainConfig::default();
        chain.chain_id = 31_337;
        let submitter = Arc::new(Submitter::new(
            sim,
            signer,
            SubmitterConfig {
                receipt_poll_interval: Duration::from_millis(5),
                ..SubmitterConfig::from_chain_config(&chain, contract_address())
            },
            None,
            metrics.clone(),
        ));

        let cohort = CohortConfig {
            name: "test".to_string(),
            assets: vec!["AAA".to_string()],
            period_s: Some(300),
        };
        let mut registry = HashMap::new();
        registry.insert("AAA".to_string(), asset_address());

        Orchestrator::new(
            cohort,
            CycleConfig::default(),
            vec![Arc::new(SimCollector::new("sim".to_string(), 25, 0.6, 10_000))],
            Arc::new(Deduplicator::new(10_000, 86_400, None)),
            Arc::new(EnsembleScorer::new(None, 0.7, 0.6, metrics.clone())),
            ManipulationDetector::new(ManipulationConfig::default()),
            submitter,
            registry,
            metrics,
        )
    }

    fn build_sim() -> Arc<SimRpc> {
        let signer = LocalSigner::from_hex_key(TEST_KEY).unwrap();
        let contract = SentimentOracle::new(signer.address(), OracleContractConfig::default());
        Arc::new(SimRpc::new(31_337, contract_address(), contract))
    }

    #[tokio::test]
    async fn test_cycle_end_to_end_against_sim_chain() {
        let sim = build_sim();
        let mut orchestrator = build_orchestrator(sim.clone());

        let now = sim.time() as i64;
        let report = orchestrator.run_cycle(now).await;

        assert_eq!(report.collected, 25);
        assert_eq!(report.deduplicated, 25);
        assert_eq!(report.scored, 25);
        assert_eq!(report.samples_emitted, 1);
        assert_eq!(report.samples_vetoed, 0);
        assert_eq!(report.confirmed, 1);
        assert!(!report.timed_out);

        // The sim chain holds the update the cycle produced.
        let entry = sim
            .with_contract(|c| c.get_sentiment(asset_address()))
            .expect("cycle should have landed an update");
        assert_eq!(entry.sample_size, 25);
        assert!(entry.score_fp.abs() <= crate::types::SCORE_SCALE);
    }

    #[tokio::test]
    async fn test_replayed_cycle_is_deduplicated() {
        let sim = build_sim();
        let mut orchestrator = build_orchestrator(sim);

        let now = 1_700_000_000;
        let first = orchestrator.run_cycle(now).await;
        assert_eq!(first.deduplicated, 25);

        // Same window replayed: every item id repeats, nothing passes.
        let second = orchestrator.run_cycle(now).await;
        assert_eq!(second.collected, 25);
        assert_eq!(second.deduplicated, 0);
        assert_eq!(second.scored, 0);
        assert_eq!(second.samples_emitted, 0);
    }
}
