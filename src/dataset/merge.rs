//! Deduplicating incremental merge

use crate::config::{DatasetConfig, DatasetFormat};
use crate::dataset::lock::DatasetLock;
use crate::dataset::traits::DatasetStore;
use crate::dataset::{CsvStore, Dataset, DatasetResult, Record, SqliteStore};
use chrono::DateTime;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Counts describing one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Keys that were not in the dataset before
    pub inserted: usize,
    /// Existing keys whose surviving row changed
    pub updated: usize,
    /// Existing keys whose surviving row is identical
    pub unchanged: usize,
    /// Incoming records without a key value
    pub rejected: usize,
    /// Rows in the dataset after the merge
    pub total: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0
    }
}

/// Merges `incoming` into `existing`, keeping one row per key
///
/// Rows are grouped over the concatenation `existing ++ incoming` and keep
/// the position where their key first appeared. Without a tie-break field the
/// last record of each group wins, so incoming data replaces existing data.
/// With one, the record holding the largest tie-break value wins and equal
/// values again go to the later record. Incoming records lacking the key are
/// counted as rejected and dropped.
pub fn merge_records(
    existing: Dataset,
    incoming: Vec<Record>,
    key_field: &str,
    tie_break: Option<&str>,
) -> (Dataset, MergeOutcome) {
    let mut outcome = MergeOutcome::default();
    let mut merged = Dataset {
        columns: existing.columns,
        rows: Vec::with_capacity(existing.rows.len() + incoming.len()),
    };
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in existing.rows {
        absorb(&mut merged, &mut index, row, key_field, tie_break);
    }

    let before: HashMap<String, Record> = index
        .iter()
        .map(|(key, &position)| (key.clone(), merged.rows[position].clone()))
        .collect();

    let mut touched: HashSet<String> = HashSet::new();
    for record in incoming {
        match record.key(key_field) {
            Some(key) => {
                touched.insert(key.to_string());
                absorb(&mut merged, &mut index, record, key_field, tie_break);
            }
            None => outcome.rejected += 1,
        }
    }

    for key in &touched {
        match before.get(key) {
            None => outcome.inserted += 1,
            Some(previous) if *previous == merged.rows[index[key]] => outcome.unchanged += 1,
            Some(_) => outcome.updated += 1,
        }
    }

    if !merged.rows.is_empty() {
        merged.key_column_first(key_field);
    }
    outcome.total = merged.rows.len();
    (merged, outcome)
}

/// Adds one record to the merge, replacing its group's survivor if it wins
fn absorb(
    merged: &mut Dataset,
    index: &mut HashMap<String, usize>,
    record: Record,
    key_field: &str,
    tie_break: Option<&str>,
) {
    let Some(key) = record.key(key_field).map(str::to_string) else {
        tracing::warn!("Dropping existing row without '{}'", key_field);
        return;
    };

    merged.extend_columns(&record);

    match index.get(&key) {
        Some(&position) => {
            let current = &merged.rows[position];
            let wins = match tie_break {
                None => true,
                Some(field) => {
                    compare_values(record.get(field), current.get(field)) != Ordering::Less
                }
            };
            if wins {
                merged.rows[position] = record;
            }
        }
        None => {
            index.insert(key, merged.rows.len());
            merged.rows.push(record);
        }
    }
}

/// Orders tie-break values
///
/// Timestamps (RFC 3339) compare as instants, numbers numerically, anything
/// else as strings. A missing value orders below any present one.
pub fn compare_values(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Ok(a), Ok(b)) = (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                return a.cmp(&b);
            }
            if let (Ok(a), Ok(b)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            }
            a.cmp(b)
        }
    }
}

/// Merges record batches into a persisted dataset under an exclusive lock
///
/// Every operation holds the dataset lock for its full read-merge-write, so
/// concurrent mergers on the same path serialize instead of losing updates.
/// Calls block the current thread; async callers run them on the blocking pool.
pub struct IncrementalMerger {
    store: Box<dyn DatasetStore>,
    key_field: String,
    tie_break: Option<String>,
    lock_timeout: Option<Duration>,
}

impl IncrementalMerger {
    pub fn new(store: Box<dyn DatasetStore>, key_field: impl Into<String>) -> Self {
        Self {
            store,
            key_field: key_field.into(),
            tie_break: None,
            lock_timeout: None,
        }
    }

    /// Picks the backend from the configured format or file extension
    pub fn from_config(config: &DatasetConfig) -> Self {
        let store: Box<dyn DatasetStore> = match config.resolved_format() {
            DatasetFormat::Csv => Box::new(CsvStore::new(config.path.clone())),
            DatasetFormat::Sqlite => {
                Box::new(SqliteStore::new(config.path.clone(), config.key_field.clone()))
            }
        };

        let mut merger = Self::new(store, config.key_field.clone());
        merger.tie_break = config.tie_break_field.clone();
        merger.lock_timeout = config.lock_timeout_seconds.map(Duration::from_secs_f64);
        merger
    }

    pub fn with_tie_break(mut self, field: impl Into<String>) -> Self {
        self.tie_break = Some(field.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Merges a batch into the persisted dataset
    ///
    /// The dataset is created on the first merge that adds rows and is only
    /// rewritten when the merge changed something.
    pub fn merge(&self, incoming: Vec<Record>) -> DatasetResult<MergeOutcome> {
        let _lock = DatasetLock::acquire(self.store.path(), self.lock_timeout)?;

        // Read, merge and write back under the lock
        let existing = self.store.load()?;
        let existing_rows = existing.len();
        let (merged, outcome) =
            merge_records(existing, incoming, &self.key_field, self.tie_break.as_deref());

        if outcome.changed() || merged.len() != existing_rows {
            self.store.replace(&merged)?;
        }

        if outcome.rejected > 0 {
            tracing::warn!(
                "Rejected {} records without '{}'",
                outcome.rejected,
                self.key_field
            );
        }
        tracing::debug!(
            "Merged into {}: {} inserted, {} updated, {} unchanged, {} total",
            self.store.path().display(),
            outcome.inserted,
            outcome.updated,
            outcome.unchanged,
            outcome.total
        );

        Ok(outcome)
    }

    /// Collapses duplicate keys already present in the dataset
    ///
    /// # Returns
    ///
    /// The number of rows removed
    pub fn dedupe(&self) -> DatasetResult<usize> {
        let _lock = DatasetLock::acquire(self.store.path(), self.lock_timeout)?;

        let existing = self.store.load()?;
        let before = existing.len();
        let columns = existing.columns.clone();
        let (merged, _) = merge_records(
            Dataset::new(columns, Vec::new()),
            existing.rows,
            &self.key_field,
            self.tie_break.as_deref(),
        );

        let removed = before - merged.len();
        if removed > 0 {
            self.store.replace(&merged)?;
            tracing::info!(
                "Removed {} duplicate rows from {}",
                removed,
                self.store.path().display()
            );
        }
        Ok(removed)
    }

    /// Merges the rows of several CSV files into the dataset in one pass
    ///
    /// Files are read in the order given, so without a tie-break field rows
    /// from later files win. Missing files are skipped with a warning; a
    /// malformed one fails the call before the dataset is touched.
    pub fn merge_files(&self, inputs: &[PathBuf]) -> DatasetResult<MergeOutcome> {
        let mut incoming = Vec::new();
        for input in inputs {
            if !input.exists() {
                tracing::warn!("Skipping missing merge input {}", input.display());
                continue;
            }
            let dataset = CsvStore::new(input.clone()).load()?;
            tracing::info!("Read {} rows from {}", dataset.len(), input.display());
            incoming.extend(dataset.rows);
        }

        self.merge(incoming)
    }

    /// Keys currently persisted
    pub fn known_keys(&self) -> DatasetResult<HashSet<String>> {
        let _lock = DatasetLock::acquire(self.store.path(), self.lock_timeout)?;
        Ok(self.store.load()?.keys(&self.key_field))
    }

    /// Snapshot of the persisted dataset
    pub fn load(&self) -> DatasetResult<Dataset> {
        let _lock = DatasetLock::acquire(self.store.path(), self.lock_timeout)?;
        self.store.load()
    }
}

impl std::fmt::Debug for IncrementalMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalMerger")
            .field("path", &self.store.path())
            .field("key_field", &self.key_field)
            .field("tie_break", &self.tie_break)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
