//! Pipeline coordinator
//!
//! Drives `WorkUnit -> fetch -> extract -> merge -> checkpoint` over a bounded
//! pool of workers:
//! - Resumes from the checkpoint and skips units it already covers
//! - Runs at most `worker_count` units at once
//! - Catches each unit's failure at the unit boundary
//! - Advances the checkpoint only through the contiguous completed prefix

use crate::checkpoint::{CheckpointStore, Cursor, ProgressTracker};
use crate::config::Config;
use crate::dataset::{DatasetError, IncrementalMerger};
use crate::fetch::ResilientFetcher;
use crate::metrics::MetricsRegistry;
use crate::pipeline::{Extractor, SelectorExtractor, WorkUnit};
use crate::{ConfigError, IngestError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Units fetched, extracted and merged this run
    pub completed: usize,
    /// Units that failed and will be retried next run
    pub failed: usize,
    /// Units covered by the checkpoint or already present in the dataset
    pub skipped: usize,
    /// Checkpoint cursor at the end of the run
    pub cursor: Cursor,
    /// Whether the run stopped early on a shutdown request
    pub interrupted: bool,
}

/// What a worker reports back for one unit
struct UnitOutcome {
    seq: u64,
    result: Result<usize, IngestError>,
}

/// Next event while waiting to dispatch a unit
enum Dispatch {
    Cancelled,
    Finished(Result<UnitOutcome, JoinError>),
    Permit(Result<OwnedSemaphorePermit, AcquireError>),
}

/// Shared, read-only state handed to every worker
struct Workers {
    fetcher: Arc<ResilientFetcher>,
    extractor: Arc<dyn Extractor>,
    merger: Arc<IncrementalMerger>,
    metrics: Arc<MetricsRegistry>,
    in_flight: AtomicUsize,
}

/// Resumable ingestion run over a list of work units
pub struct Pipeline {
    workers: Arc<Workers>,
    checkpoint: CheckpointStore,
    worker_count: usize,
    skip_known_keys: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Creates a pipeline from its collaborators
    ///
    /// # Arguments
    ///
    /// * `fetcher` - Shared resilient fetcher
    /// * `extractor` - Turns payloads into records
    /// * `merger` - Target dataset
    /// * `checkpoint` - Cursor store; loaded at the start of `run`
    /// * `metrics` - Registry receiving unit counters and timings
    /// * `worker_count` - Maximum units in flight
    pub fn new(
        fetcher: Arc<ResilientFetcher>,
        extractor: Arc<dyn Extractor>,
        merger: Arc<IncrementalMerger>,
        checkpoint: CheckpointStore,
        metrics: Arc<MetricsRegistry>,
        worker_count: usize,
    ) -> Self {
        Self {
            workers: Arc::new(Workers {
                fetcher,
                extractor,
                merger,
                metrics,
                in_flight: AtomicUsize::new(0),
            }),
            checkpoint,
            worker_count: worker_count.max(1),
            skip_known_keys: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds every collaborator from the configuration
    ///
    /// Requires an `[extract]` section.
    pub fn from_config(
        config: &Config,
        config_hash: Option<String>,
        metrics: Arc<MetricsRegistry>,
    ) -> crate::Result<Self> {
        let extract = config.extract.as_ref().ok_or_else(|| {
            ConfigError::Validation("an [extract] section is required to run".to_string())
        })?;
        let extractor = SelectorExtractor::from_config(extract)?
            .with_unit_key(config.dataset.key_field.clone());

        let fetcher = ResilientFetcher::from_config(config, metrics.clone())?;
        let merger = IncrementalMerger::from_config(&config.dataset);

        let mut checkpoint = CheckpointStore::from_config(&config.checkpoint);
        if let Some(hash) = config_hash {
            checkpoint = checkpoint.with_config_hash(hash);
        }

        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(extractor),
            Arc::new(merger),
            checkpoint,
            metrics,
            config.workers.worker_count,
        )
        .with_skip_known_keys(config.units.skip_known_keys))
    }

    /// Treats units whose key is already in the dataset as completed
    pub fn with_skip_known_keys(mut self, skip: bool) -> Self {
        self.skip_known_keys = skip;
        self
    }

    /// Uses `token` as the shutdown signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops dispatching new units when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Runs every unit not yet covered by the checkpoint
    ///
    /// Unit failures are counted, not returned. The run itself fails only on
    /// checkpoint errors and dataset corruption.
    pub async fn run(&mut self, mut units: Vec<WorkUnit>) -> crate::Result<RunReport> {
        // Resume point and, optionally, the keys already stored
        let resume = self.checkpoint.load()?;
        let mut tracker = ProgressTracker::new(resume);
        let metrics = self.workers.metrics.clone();

        let known_keys = if self.skip_known_keys {
            let merger = self.workers.merger.clone();
            tokio::task::spawn_blocking(move || merger.known_keys())
                .await
                .map_err(join_error)??
        } else {
            HashSet::new()
        };

        units.sort_by_key(|u| u.seq);
        let mut report = RunReport {
            completed: 0,
            failed: 0,
            skipped: 0,
            cursor: resume,
            interrupted: false,
        };

        tracing::info!(
            "Starting run: {} units, resuming at unit {}, {} workers",
            units.len(),
            resume.next_unit(),
            self.worker_count
        );

        // Dispatch loop: one permit per in-flight unit
        let cancel = self.cancel.clone();
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut tasks: JoinSet<UnitOutcome> = JoinSet::new();

        for unit in units {
            if resume.covers(unit.seq) {
                report.skipped += 1;
                metrics.increment("units.skipped");
                continue;
            }

            if unit.key.as_ref().is_some_and(|k| known_keys.contains(k)) {
                tracing::debug!("Unit {} already in dataset, skipping", unit.seq);
                report.skipped += 1;
                metrics.increment("units.skipped");
                self.record_completion(&mut tracker, unit.seq)?;
                continue;
            }

            // Wait for a free worker, settling finished units meanwhile
            let permit = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Dispatch::Cancelled,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        Dispatch::Finished(joined)
                    }
                    permit = semaphore.clone().acquire_owned() => Dispatch::Permit(permit),
                };

                match next {
                    Dispatch::Cancelled => break None,
                    Dispatch::Finished(joined) => {
                        if let Err(e) = self.settle(joined, &mut tracker, &mut report) {
                            tasks.abort_all();
                            return Err(e);
                        }
                    }
                    Dispatch::Permit(permit) => {
                        break Some(permit.map_err(|e| IngestError::Task(e.to_string()))?);
                    }
                }
            };

            let Some(permit) = permit else {
                tracing::warn!("Shutdown requested, no further units will be dispatched");
                report.interrupted = true;
                break;
            };

            tasks.spawn(process_unit(self.workers.clone(), unit, permit));
        }

        // Drain in-flight units
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = self.settle(joined, &mut tracker, &mut report) {
                tasks.abort_all();
                return Err(e);
            }
        }

        report.cursor = tracker.cursor();
        if let Cursor::Completed(n) = report.cursor {
            metrics.set_gauge("checkpoint.cursor", n as f64);
        }

        tracing::info!(
            "Run finished: {} completed, {} failed, {} skipped, checkpoint at {}",
            report.completed,
            report.failed,
            report.skipped,
            report.cursor
        );
        Ok(report)
    }

    /// Folds one finished worker into the report and the checkpoint
    fn settle(
        &mut self,
        joined: Result<UnitOutcome, JoinError>,
        tracker: &mut ProgressTracker,
        report: &mut RunReport,
    ) -> crate::Result<()> {
        let outcome = joined.map_err(join_error)?;
        let metrics = &self.workers.metrics;

        match outcome.result {
            Ok(merged) => {
                report.completed += 1;
                metrics.increment("units.completed");
                tracing::debug!("Unit {} done, {} records merged", outcome.seq, merged);
                self.record_completion(tracker, outcome.seq)
            }
            Err(IngestError::Dataset(e)) if e.is_fatal() => {
                tracing::error!("Dataset unusable, aborting run: {}", e);
                Err(IngestError::Dataset(e))
            }
            Err(e) => {
                report.failed += 1;
                tracker.fail(outcome.seq);
                metrics.increment("units.failed");
                metrics.record_error(error_kind(&e));
                tracing::warn!("Unit {} failed: {}", outcome.seq, e);
                Ok(())
            }
        }
    }

    fn record_completion(&mut self, tracker: &mut ProgressTracker, seq: u64) -> crate::Result<()> {
        if let Some(cursor) = tracker.complete(seq) {
            self.checkpoint.advance(cursor)?;
            self.workers
                .metrics
                .set_gauge("checkpoint.cursor", cursor as f64);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("checkpoint", &self.checkpoint)
            .field("worker_count", &self.worker_count)
            .field("skip_known_keys", &self.skip_known_keys)
            .finish()
    }
}

/// One unit end to end; the permit is held until the unit is merged
async fn process_unit(
    workers: Arc<Workers>,
    unit: WorkUnit,
    permit: OwnedSemaphorePermit,
) -> UnitOutcome {
    let _permit = permit;
    let in_flight = workers.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    workers.metrics.set_gauge("workers.in_flight", in_flight as f64);

    let result = {
        let _timer = workers.metrics.start_timer("unit");
        fetch_extract_merge(&workers, &unit).await
    };

    let in_flight = workers.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
    workers.metrics.set_gauge("workers.in_flight", in_flight as f64);

    UnitOutcome {
        seq: unit.seq,
        result,
    }
}

async fn fetch_extract_merge(workers: &Workers, unit: &WorkUnit) -> crate::Result<usize> {
    let fetched = workers.fetcher.fetch(unit).await.into_outcome()?;
    let payload = fetched.payload.unwrap_or_default();

    let records = workers.extractor.extract(unit, &payload)?;
    let extracted = records.len();

    // The lock and the dataset I/O block
    let merger = workers.merger.clone();
    let metrics = workers.metrics.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _timer = metrics.start_timer("merge");
        merger.merge(records)
    })
    .await
    .map_err(join_error)??;

    let merged = outcome.inserted + outcome.updated;
    workers.metrics.increment_by("records.merged", merged as u64);
    tracing::info!(
        "Unit {} ({}): {} records extracted, {} new, {} updated",
        unit.seq,
        unit.target,
        extracted,
        outcome.inserted,
        outcome.updated
    );
    Ok(merged)
}

fn join_error(e: JoinError) -> IngestError {
    IngestError::Task(e.to_string())
}

/// Error counter label for a failed unit
fn error_kind(error: &IngestError) -> &'static str {
    match error {
        IngestError::Fetch(e) => e.kind(),
        IngestError::Extract(_) => "extract",
        IngestError::Dataset(DatasetError::LockTimeout { .. }) => "merge_conflict",
        IngestError::Dataset(_) => "dataset",
        _ => "internal",
    }
}
