//! Monotonic counters for pipeline observability.
//!
//! Every error kind in the taxonomy maps to exactly one counter here;
//! nothing is swallowed silently except empty aggregates, which get their
//! own counter anyway.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-wide counters. Shared via `Arc`, updated lock-free.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Cycle lifecycle
    pub cycles_started: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub cycles_timeout: AtomicU64,

    // Collection
    pub items_collected: AtomicU64,
    pub source_transient_errors: AtomicU64,
    pub source_terminal_errors: AtomicU64,
    pub collects_cancelled: AtomicU64,
    pub rate_limit_waits: AtomicU64,

    // Dedup / scoring / aggregation
    pub items_deduplicated: AtomicU64,
    pub items_scored: AtomicU64,
    pub scorer_degraded: AtomicU64,
    pub aggregates_empty: AtomicU64,
    pub samples_emitted: AtomicU64,

    // Manipulation gate
    pub samples_vetoed: AtomicU64,

    // Submission
    pub submit_skipped_min_interval: AtomicU64,
    pub submit_skipped_circuit_breaker: AtomicU64,
    pub tx_broadcast: AtomicU64,
    pub tx_confirmed: AtomicU64,
    pub tx_reverted: AtomicU64,
    pub tx_dropped_replaced: AtomicU64,
    pub nonce_resyncs: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub signer_errors: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_timeout: u64,
    pub items_collected: u64,
    pub source_transient_errors: u64,
    pub source_terminal_errors: u64,
    pub collects_cancelled: u64,
    pub rate_limit_waits: u64,
    pub items_deduplicated: u64,
    pub items_scored: u64,
    pub scorer_degraded: u64,
    pub aggregates_empty: u64,
    pub samples_emitted: u64,
    pub samples_vetoed: u64,
    pub submit_skipped_min_interval: u64,
    pub submit_skipped_circuit_breaker: u64,
    pub tx_broadcast: u64,
    pub tx_confirmed: u64,
    pub tx_reverted: u64,
    pub tx_dropped_replaced: u64,
    pub nonce_resyncs: u64,
    pub rpc_errors: u64,
    pub signer_errors: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cycles_started: load(&self.cycles_started),
            cycles_completed: load(&self.cycles_completed),
            cycles_timeout: load(&self.cycles_timeout),
            items_collected: load(&self.items_collected),
            source_transient_errors: load(&self.source_transient_errors),
            source_terminal_errors: load(&self.source_terminal_errors),
            collects_cancelled: load(&self.collects_cancelled),
            rate_limit_waits: load(&self.rate_limit_waits),
            items_deduplicated: load(&self.items_deduplicated),
            items_scored: load(&self.items_scored),
            scorer_degraded: load(&self.scorer_degraded),
            aggregates_empty: load(&self.aggregates_empty),
            samples_emitted: load(&self.samples_emitted),
            samples_vetoed: load(&self.samples_vetoed),
            submit_skipped_min_interval: load(&self.submit_skipped_min_interval),
            submit_skipped_circuit_breaker: load(&self.submit_skipped_circuit_breaker),
            tx_broadcast: load(&self.tx_broadcast),
            tx_confirmed: load(&self.tx_confirmed),
            tx_reverted: load(&self.tx_reverted),
            tx_dropped_replaced: load(&self.tx_dropped_replaced),
            nonce_resyncs: load(&self.nonce_resyncs),
            rpc_errors: load(&self.rpc_errors),
            signer_errors: load(&self.signer_errors),
        }
    }

    /// Emit a one-line summary, called at cycle end.
    pub fn log_summary(&self, cohort: &str) {
        let s = self.snapshot();
        info!(
            cohort,
            cycles = s.cycles_completed,
            timeouts = s.cycles_timeout,
            collected = s.items_collected,
            deduplicated = s.items_deduplicated,
            scored = s.items_scored,
            emitted = s.samples_emitted,
            vetoed = s.samples_vetoed,
            broadcast = s.tx_broadcast,
            confirmed = s.tx_confirmed,
            reverted = s.tx_reverted,
            "cycle metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = PipelineMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles_started, 0);
        assert_eq!(snapshot.tx_broadcast, 0);
        assert_eq!(snapshot.samples_vetoed, 0);
    }

    #[test]
    fn test_inc_and_add() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::inc(&metrics.cycles_started);
        PipelineMetrics::inc(&metrics.cycles_started);
        PipelineMetrics::add(&metrics.items_collected, 42);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles_started, 2);
        assert_eq!(snapshot.items_collected, 42);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let metrics = PipelineMetrics::new();
        let before = metrics.snapshot();
        PipelineMetrics::inc(&metrics.tx_confirmed);
        let after = metrics.snapshot();
        assert_eq!(before.tx_confirmed, 0);
        assert_eq!(after.tx_confirmed, 1);
        assert_ne!(before, after);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = PipelineMetrics::new();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"samples_vetoed\":0"));
    }
}
