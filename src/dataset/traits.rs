//! Storage trait for persisted datasets

use crate::dataset::{DatasetResult, Dataset};
use std::path::Path;

/// Backend holding the persisted dataset
///
/// Implementations do no locking of their own; callers hold the dataset lock
/// around every `load`/`replace` pair. `replace` must be atomic: a crash
/// leaves either the old or the new dataset, never a mix.
pub trait DatasetStore: Send + Sync {
    /// Reads the whole dataset; a missing file is an empty dataset
    fn load(&self) -> DatasetResult<Dataset>;

    /// Replaces the persisted dataset with `dataset`
    fn replace(&self, dataset: &Dataset) -> DatasetResult<()>;

    /// Whether anything has been written yet
    fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Location of the dataset; the lock file lives next to it
    fn path(&self) -> &Path;
}
