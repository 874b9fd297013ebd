//! Exponential backoff for Chain Client calls.
//!
//! Only [`ClientError::Transient`] failures are retried. Permanent failures
//! and exhausted retries are returned to the caller unchanged.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::indexer::RetrySettings;
use crate::metrics::IndexerMetrics;

/// Stateless retry policy: computes the next delay given the attempt number.
///
/// Every attempt's duration and every retry is recorded on `metrics`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub settings: RetrySettings,
    pub metrics: IndexerMetrics,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            metrics: IndexerMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: IndexerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.settings.max_retries {
            return None;
        }
        let base_ms = self.settings.initial_backoff_ms as f64
            * self.settings.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.settings.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = op().await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) if e.is_transient() => "transient",
                Err(_) => "permanent",
            };
            self.metrics.record_rpc(what, outcome, started.elapsed());
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    match self.next_delay(attempt) {
                        Some(delay) => {
                            self.metrics.record_retry(what);
                            tracing::debug!(
                                call = what,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Transient client error, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::warn!(call = what, attempts = attempt, error = %e, "Retries exhausted");
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetrySettings {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        })
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(RetrySettings {
            max_retries: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert!(policy.next_delay(5).is_none());
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = fast(3)
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Transient("rate limited".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), _> = fast(3)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Permanent("pruned".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_are_counted_per_call() {
        use opentelemetry::metrics::MeterProvider;
        use opentelemetry_sdk::metrics::data::Sum;
        use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
        use opentelemetry_sdk::testing::metrics::InMemoryMetricExporter;

        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(
                PeriodicReader::builder(exporter.clone(), opentelemetry_sdk::runtime::Tokio).build(),
            )
            .build();
        let policy = fast(3).with_metrics(IndexerMetrics::new(&provider.meter("test")));

        let calls = AtomicU32::new(0);
        let counter = &calls;
        policy
            .run("get_logs", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Transient("rate limited".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        provider.force_flush().unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        let retries: u64 = exported
            .iter()
            .flat_map(|rm| rm.scope_metrics.iter())
            .flat_map(|sm| sm.metrics.iter())
            .filter(|m| m.name == "chainscan.rpc_retries")
            .filter_map(|m| m.data.as_any().downcast_ref::<Sum<u64>>())
            .flat_map(|sum| sum.data_points.iter().map(|p| p.value))
            .sum();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), _> = fast(2)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Transient("timeout".into()))
            })
            .await;
        assert!(out.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
