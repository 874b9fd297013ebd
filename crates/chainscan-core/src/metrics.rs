//! Indexer metrics.
//!
//! All metrics use OpenTelemetry conventions and go to whatever meter
//! provider is installed globally; without one they are no-ops. The CLI
//! installs an OTLP exporter when an endpoint is configured.

use std::fmt;
use std::time::Duration;

use opentelemetry::{
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Meter name under which every instrument is registered.
pub const METER_NAME: &str = "chainscan";

/// Central metrics handle for the worker loop, block processor and retry policy.
#[derive(Clone)]
pub struct IndexerMetrics {
    pub blocks_processed: Counter<u64>,
    pub block_processing_ms: Histogram<f64>,
    pub apply_ms: Histogram<f64>,
    pub rpc_call_ms: Histogram<f64>,
    pub rpc_retries: Counter<u64>,
    pub log_refetches: Counter<u64>,
    pub reorgs_detected: Counter<u64>,
    pub blocks_rolled_back: Counter<u64>,
    pub reorg_recovery_ms: Histogram<f64>,
    pub range_failures: Counter<u64>,
    pub blocks_to_process: Gauge<u64>,
}

impl fmt::Debug for IndexerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexerMetrics").finish_non_exhaustive()
    }
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::global()
    }
}

impl IndexerMetrics {
    /// Instruments registered on the global meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    pub fn new(meter: &Meter) -> Self {
        Self {
            blocks_processed: meter
                .u64_counter("chainscan.blocks_processed")
                .with_description("Blocks handled by a worker, tagged with the outcome")
                .build(),
            block_processing_ms: meter
                .f64_histogram("chainscan.block_processing_ms")
                .with_description("Time to fetch, decode and apply one block in milliseconds")
                .build(),
            apply_ms: meter
                .f64_histogram("chainscan.apply_ms")
                .with_description("Time to commit one block's write set in milliseconds")
                .build(),
            rpc_call_ms: meter
                .f64_histogram("chainscan.rpc_call_ms")
                .with_description("Duration of a single chain client call in milliseconds")
                .build(),
            rpc_retries: meter
                .u64_counter("chainscan.rpc_retries")
                .with_description("Chain client calls retried after a transient failure")
                .build(),
            log_refetches: meter
                .u64_counter("chainscan.log_refetches")
                .with_description("Log fetches repeated because they came from another block hash")
                .build(),
            reorgs_detected: meter
                .u64_counter("chainscan.reorgs_detected")
                .with_description("Chain reorganisations detected")
                .build(),
            blocks_rolled_back: meter
                .u64_counter("chainscan.blocks_rolled_back")
                .with_description("Persisted blocks removed by reorg recovery")
                .build(),
            reorg_recovery_ms: meter
                .f64_histogram("chainscan.reorg_recovery_ms")
                .with_description("Time from divergence search to reopened ranges in milliseconds")
                .build(),
            range_failures: meter
                .u64_counter("chainscan.range_failures")
                .with_description("Worker iterations that failed without being fatal")
                .build(),
            blocks_to_process: meter
                .u64_gauge("chainscan.blocks_to_process")
                .with_description("Blocks between the contiguous frontier and the chain head")
                .build(),
        }
    }

    /// `outcome` is one of `applied`, `already_applied`, `reorg`, `error`.
    pub fn record_block(&self, outcome: &'static str, elapsed: Duration) {
        let attrs = [KeyValue::new("outcome", outcome)];
        self.blocks_processed.add(1, &attrs);
        self.block_processing_ms.record(millis(elapsed), &attrs);
    }

    pub fn record_apply(&self, elapsed: Duration) {
        self.apply_ms.record(millis(elapsed), &[]);
    }

    /// `outcome` is one of `ok`, `transient`, `permanent`.
    pub fn record_rpc(&self, function: &str, outcome: &'static str, elapsed: Duration) {
        self.rpc_call_ms.record(
            millis(elapsed),
            &[
                KeyValue::new("function", function.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn record_retry(&self, function: &str) {
        self.rpc_retries
            .add(1, &[KeyValue::new("function", function.to_string())]);
    }

    pub fn record_log_refetch(&self) {
        self.log_refetches.add(1, &[]);
    }

    pub fn record_reorg(&self, diverged_at: u64, rolled_back: u64, elapsed: Duration) {
        self.reorgs_detected.add(1, &[]);
        self.blocks_rolled_back.add(rolled_back, &[]);
        self.reorg_recovery_ms.record(millis(elapsed), &[]);
        tracing::debug!(diverged_at, rolled_back, "Reorg recorded");
    }

    pub fn record_range_failure(&self, worker: &str, consecutive: u32) {
        self.range_failures.add(
            1,
            &[
                KeyValue::new("worker", worker.to_string()),
                KeyValue::new("repeated", consecutive > 1),
            ],
        );
    }

    pub fn set_blocks_to_process(&self, n: u64) {
        self.blocks_to_process.record(n, &[]);
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::testing::metrics::InMemoryMetricExporter;
    use opentelemetry_sdk::runtime;

    fn exported_names(exporter: &InMemoryMetricExporter) -> Vec<String> {
        let mut names: Vec<String> = exporter
            .get_finished_metrics()
            .unwrap()
            .iter()
            .flat_map(|rm| rm.scope_metrics.iter())
            .flat_map(|sm| sm.metrics.iter())
            .map(|m| m.name.to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorded_instruments_are_exported() {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone(), runtime::Tokio).build())
            .build();
        let metrics = IndexerMetrics::new(&provider.meter(METER_NAME));

        metrics.record_block("applied", Duration::from_millis(4));
        metrics.record_rpc("get_block", "transient", Duration::from_millis(12));
        metrics.record_retry("get_block");
        metrics.record_reorg(100, 6, Duration::from_millis(30));
        metrics.record_range_failure("w-0", 3);
        metrics.set_blocks_to_process(42);
        provider.force_flush().unwrap();

        let names = exported_names(&exporter);
        for expected in [
            "chainscan.block_processing_ms",
            "chainscan.blocks_processed",
            "chainscan.blocks_rolled_back",
            "chainscan.blocks_to_process",
            "chainscan.range_failures",
            "chainscan.reorgs_detected",
            "chainscan.rpc_call_ms",
            "chainscan.rpc_retries",
        ] {
            assert!(names.iter().any(|n| n == expected), "{expected} missing from {names:?}");
        }
    }

    #[test]
    fn global_handle_without_provider_is_a_noop() {
        let metrics = IndexerMetrics::global();
        metrics.record_apply(Duration::from_millis(1));
        metrics.record_log_refetch();
        assert_eq!(format!("{metrics:?}"), "IndexerMetrics { .. }");
    }
}
