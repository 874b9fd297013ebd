//! The worker loop: claim a range, process and apply it block by block,
//! complete it; route reorg signals through the reorg protocol.
//!
//! # Loop
//! 1. Resume a reorg hold left behind by a crashed worker, if any
//! 2. Claim a range at or below the chain head
//! 3. For each block: heartbeat, process, apply
//! 4. Complete the range
//!
//! With nothing to claim the worker checks that the highest stored block is
//! still canonical (a vanished tip is a reorg) and sleeps `poll_interval_ms`.
//!
//! # Reorg protocol
//! divergence search → hold at `n` → rollback `>= n` → reopen ranges `>= n`
//! (which also releases the hold).

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tokio::sync::watch;

use chainscan_core::client::{BlockId, ChainClient};
use chainscan_core::decoder::LogDecoder;
use chainscan_core::error::IndexerError;
use chainscan_core::finality::FinalityTracker;
use chainscan_core::indexer::{IndexerConfig, IndexerState};
use chainscan_core::metrics::IndexerMetrics;
use chainscan_core::reorg::ReorgDetector;
use chainscan_core::retry::RetryPolicy;
use chainscan_core::scheduler::RangeScheduler;
use chainscan_core::store::{ApplyOutcome, Store};
use chainscan_core::types::BlockScanRange;

use crate::processor::BlockProcessor;

/// Consecutive failed iterations after which a worker escalates to `error`.
const REPEATED_FAILURES: u32 = 3;

/// Cooperative stop signal shared by workers and the finality loop.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A trigger and the signal it controls. Dropping the trigger also stops.
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// How processing one block ended.
enum Step {
    Applied,
    Reorg { detected_at: u64 },
}

pub struct Worker<S: ?Sized, C: ?Sized> {
    config: IndexerConfig,
    store: Arc<S>,
    client: Arc<C>,
    scheduler: RangeScheduler<S>,
    processor: BlockProcessor<S, C>,
    reorg: ReorgDetector,
    retry: RetryPolicy,
    metrics: IndexerMetrics,
    state: IndexerState,
    consecutive_failures: u32,
    shutdown: Shutdown,
}

impl<S, C> Worker<S, C>
where
    S: Store + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(
        config: IndexerConfig,
        store: Arc<S>,
        client: Arc<C>,
        decoder: Arc<dyn LogDecoder>,
        shutdown: Shutdown,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            scheduler: RangeScheduler::new(store.clone(), &config),
            processor: BlockProcessor::new(store.clone(), client.clone(), decoder, retry.clone()),
            reorg: ReorgDetector::new(config.max_reorg_depth),
            metrics: retry.metrics.clone(),
            retry,
            state: IndexerState::Idle,
            consecutive_failures: 0,
            store,
            client,
            config,
            shutdown,
        }
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn worker_id(&self) -> &str {
        self.scheduler.worker_id()
    }

    /// Run until shutdown, until a bounded run is finished, or until a fatal error.
    ///
    /// Non-fatal failures (a stuck range, an unavailable store) are logged and
    /// retried after `poll_interval_ms`; a stuck range stays claimed and is
    /// reclaimed once its lease expires.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        self.config.validate()?;
        tracing::info!(
            worker = %self.worker_id(),
            from = self.config.from_block,
            to = ?self.config.to_block,
            range_size = self.config.range_size,
            "Worker starting"
        );

        loop {
            if self.shutdown.is_triggered() {
                self.state = IndexerState::Stopped;
                tracing::info!(worker = %self.worker_id(), "Worker stopped");
                return Ok(());
            }

            let ticked = self.tick().await;
            if ticked.is_ok() {
                self.consecutive_failures = 0;
            }
            match ticked {
                Ok(true) => {}
                Ok(false) => {
                    if self.scheduler.is_finished().await? {
                        self.state = IndexerState::Stopped;
                        tracing::info!(worker = %self.worker_id(), "Bounded run complete");
                        return Ok(());
                    }
                    self.state = IndexerState::Live;
                    self.idle().await;
                }
                Err(e) if e.is_fatal() => {
                    self.state = IndexerState::Error;
                    tracing::error!(worker = %self.worker_id(), error = %e, "Worker failed");
                    return Err(e);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    let consecutive = self.consecutive_failures;
                    self.metrics.record_range_failure(self.scheduler.worker_id(), consecutive);
                    if consecutive >= REPEATED_FAILURES {
                        tracing::error!(
                            worker = %self.worker_id(),
                            consecutive,
                            error = %e,
                            "Worker keeps failing on the same work"
                        );
                    } else {
                        tracing::warn!(
                            worker = %self.worker_id(),
                            consecutive,
                            error = %e,
                            "Worker iteration failed"
                        );
                    }
                    self.idle().await;
                }
            }
        }
    }

    /// One pass of the loop. Returns `false` when there was nothing to claim.
    async fn tick(&mut self) -> Result<bool, IndexerError> {
        if let Some(hold) = self.scheduler.pending_hold().await? {
            tracing::info!(worker = %self.worker_id(), from = hold, "Resuming pending reorg hold");
            self.recover(hold).await?;
        }

        let client = &*self.client;
        let head = self
            .retry
            .run("block_number", || client.block_number())
            .await?;
        let frontier = self.store.frontier().await?.unwrap_or(self.config.from_block);
        self.metrics
            .set_blocks_to_process(head.saturating_add(1).saturating_sub(frontier));

        match self.scheduler.claim_range(head).await? {
            Some(range) => {
                self.state = IndexerState::Scanning;
                self.scan(range).await?;
                Ok(true)
            }
            None => {
                self.check_tip().await?;
                Ok(false)
            }
        }
    }

    /// Process a claimed range in ascending order and complete it.
    async fn scan(&mut self, mut range: BlockScanRange) -> Result<(), IndexerError> {
        let mut next = range.from;
        tracing::info!(worker = %self.worker_id(), from = range.from, to = range.to, "Scanning range");

        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            match self.scheduler.heartbeat(&range).await? {
                Some(current) => range = current,
                None => {
                    tracing::info!(
                        worker = %self.worker_id(),
                        from = range.from,
                        to = range.to,
                        "Range ownership lost"
                    );
                    return Ok(());
                }
            }
            if next > range.to {
                self.scheduler.complete_range(&range).await?;
                return Ok(());
            }
            if let Some(hold) = self.scheduler.pending_hold().await? {
                if next >= hold {
                    tracing::debug!(block = next, hold, "Paused by reorg hold");
                    return Ok(());
                }
            }

            match self.step(next).await {
                Ok(Step::Applied) => next += 1,
                Ok(Step::Reorg { detected_at }) => {
                    self.handle_reorg(detected_at).await?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    return Err(IndexerError::RangeStuck {
                        from: range.from,
                        to: range.to,
                        block_number: next,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn step(&mut self, number: u64) -> Result<Step, IndexerError> {
        let started = Instant::now();
        let (outcome, step) = match self.process_and_apply(number).await {
            Ok((outcome, step)) => (outcome, Ok(step)),
            Err(e) => ("error", Err(e)),
        };
        self.metrics.record_block(outcome, started.elapsed());
        step
    }

    async fn process_and_apply(&mut self, number: u64) -> Result<(&'static str, Step), IndexerError> {
        let ws = match self.processor.process(number).await {
            Ok(ws) => ws,
            Err(IndexerError::ReorgDetected { block_number, .. }) => {
                return Ok((
                    "reorg",
                    Step::Reorg {
                        detected_at: block_number,
                    },
                ));
            }
            Err(e) => return Err(e),
        };
        let applying = Instant::now();
        let applied = self.store.apply(&ws).await?;
        self.metrics.record_apply(applying.elapsed());
        match applied {
            ApplyOutcome::Applied => {
                self.processor.accept(&ws.block);
                Ok(("applied", Step::Applied))
            }
            ApplyOutcome::AlreadyApplied => {
                tracing::debug!(block = number, "Block already applied");
                self.processor.accept(&ws.block);
                Ok(("already_applied", Step::Applied))
            }
            ApplyOutcome::ParentMismatch { at } => Ok(("reorg", Step::Reorg { detected_at: at })),
        }
    }

    async fn handle_reorg(&mut self, detected_at: u64) -> Result<(), IndexerError> {
        self.state = IndexerState::ReorgRecovery;
        let started = Instant::now();
        let event = self
            .reorg
            .find_divergence(&*self.store, &*self.client, &self.retry, detected_at)
            .await?;
        self.scheduler.hold_from(event.diverged_at).await?;
        let removed = self.recover(event.diverged_at).await?;
        self.metrics
            .record_reorg(event.diverged_at, removed, started.elapsed());
        self.state = IndexerState::Scanning;
        Ok(())
    }

    /// Rollback and reopen from `number`; safe to repeat after a crash.
    /// Returns the number of blocks removed.
    async fn recover(&mut self, number: u64) -> Result<u64, IndexerError> {
        let removed = self.store.rollback_from(number).await?;
        self.processor.rewind_below(number);
        let reopened = self.scheduler.reopen_from(number).await?;
        tracing::info!(from = number, removed, reopened, "Reorg recovery complete");
        Ok(removed)
    }

    /// The highest stored block must still be canonical.
    async fn check_tip(&mut self) -> Result<(), IndexerError> {
        let Some(tip) = self.store.last_block().await? else {
            return Ok(());
        };
        let client = &*self.client;
        let canonical = self
            .retry
            .run("get_block", || client.get_block(BlockId::Number(tip.number)))
            .await?;
        if canonical.as_ref().map(|b| b.hash.as_str()) == Some(tip.hash.as_str()) {
            return Ok(());
        }
        tracing::warn!(block = tip.number, stored = %tip.hash, "Stored tip is no longer canonical");
        self.handle_reorg(tip.number + 1).await?;
        self.state = IndexerState::Live;
        Ok(())
    }

    async fn idle(&mut self) {
        let interval = self.config.poll_interval();
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => {}
        }
    }
}

/// Poll finality signals every `interval` until shutdown.
pub async fn run_finality<S, C>(
    store: Arc<S>,
    client: Arc<C>,
    retry: RetryPolicy,
    interval: Duration,
    mut shutdown: Shutdown,
) -> Result<(), IndexerError>
where
    S: Store + ?Sized,
    C: ChainClient + ?Sized,
{
    let mut tracker = FinalityTracker::new(store);
    loop {
        match tracker.poll_once(&*client, &retry).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "Finality poll failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => return Ok(()),
        }
    }
}

/// Run `config.workers` workers and the finality loop against one store.
///
/// Returns when every worker has stopped (shutdown or a finished bounded
/// run), or with the first fatal error.
pub async fn run_indexer<S, C>(
    config: IndexerConfig,
    store: Arc<S>,
    client: Arc<C>,
    decoder: Arc<dyn LogDecoder>,
    shutdown: Shutdown,
) -> Result<(), IndexerError>
where
    S: Store + ?Sized,
    C: ChainClient + ?Sized,
{
    config.validate()?;
    let workers = (0..config.workers).map(|i| {
        let mut cfg = config.clone();
        if config.workers > 1 {
            cfg.worker_id = format!("{}-{i}", config.worker_id);
        }
        let mut worker = Worker::new(
            cfg,
            store.clone(),
            client.clone(),
            decoder.clone(),
            shutdown.clone(),
        );
        async move { worker.run().await }
    });
    let workers = try_join_all(workers);
    tokio::pin!(workers);

    let finality = run_finality(
        store.clone(),
        client.clone(),
        RetryPolicy::new(config.retry.clone()),
        config.finality_poll_interval(),
        shutdown,
    );
    tokio::pin!(finality);

    tokio::select! {
        done = &mut workers => return done.map(drop),
        stopped = &mut finality => stopped?,
    }
    workers.await.map(drop)
}
