use crate::fsutil;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background task persisting metrics snapshots on a fixed interval
///
/// Cancellation is explicit: [`shutdown`](Self::shutdown) signals the task,
/// which writes one final snapshot and exits, and then joins it.
#[derive(Debug)]
pub struct MetricsReporter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MetricsReporter {
    /// Starts the reporter
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry to snapshot
    /// * `path` - Snapshot file, replaced atomically on every write
    /// * `interval` - Time between snapshots; zero only writes on shutdown
    pub fn spawn(registry: Arc<MetricsRegistry>, path: PathBuf, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(registry, path, interval, token.clone()));
        Self { token, handle }
    }

    /// Token that stops the reporter when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops the task and waits for the final snapshot to be written
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("Metrics reporter task failed: {}", e);
        }
    }
}

async fn run(
    registry: Arc<MetricsRegistry>,
    path: PathBuf,
    interval: Duration,
    token: CancellationToken,
) {
    if !interval.is_zero() {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    registry.record_resource_usage();
                    let snapshot = registry.snapshot();
                    log_summary(&snapshot);
                    if let Err(e) = persist(&snapshot, &path).await {
                        tracing::warn!(
                            "Failed to write metrics snapshot {}: {}",
                            path.display(),
                            e
                        );
                    }
                }
            }
        }
    } else {
        token.cancelled().await;
    }

    // Final snapshot
    registry.record_resource_usage();
    let snapshot = registry.snapshot();
    log_summary(&snapshot);
    match persist(&snapshot, &path).await {
        Ok(()) => tracing::debug!("Final metrics snapshot written to {}", path.display()),
        Err(e) => tracing::warn!(
            "Failed to write final metrics snapshot {}: {}",
            path.display(),
            e
        ),
    }
}

async fn persist(snapshot: &MetricsSnapshot, path: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || fsutil::atomic_write(&path, &json))
        .await
        .map_err(io::Error::other)?
}

/// Writes one snapshot of `registry` to `path` right away
pub fn write_snapshot(registry: &MetricsRegistry, path: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(&registry.snapshot()).map_err(io::Error::other)?;
    fsutil::atomic_write(path, &json)
}

/// Reads a snapshot previously written by the reporter
pub fn read_snapshot(path: &Path) -> io::Result<Option<MetricsSnapshot>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// One-line progress summary
fn log_summary(snapshot: &MetricsSnapshot) {
    let completed = snapshot.counter("units.completed");
    let failed = snapshot.counter("units.failed");
    let finished = completed + failed;
    let success_rate = if finished == 0 {
        0.0
    } else {
        completed as f64 * 100.0 / finished as f64
    };
    let mean_fetch = snapshot
        .timers
        .get("fetch")
        .map(|t| t.mean_ms)
        .unwrap_or(0.0);

    tracing::info!(
        "Metrics: {} requests, {} units done, {:.1}% success, mean fetch {:.0}ms, {} errors",
        snapshot.counter("fetch.attempts"),
        finished,
        success_rate,
        mean_fetch,
        snapshot.counter("errors.total")
    );
}
