use crate::dataset::{DatasetError, DatasetResult};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on a dataset, released when dropped
///
/// The lock is taken on a `<dataset>.lock` marker next to the dataset rather
/// than on the dataset itself, because the dataset file is replaced by rename
/// on every write.
#[derive(Debug)]
pub struct DatasetLock {
    file: File,
    path: PathBuf,
}

impl DatasetLock {
    /// Path of the marker file guarding `dataset`
    pub fn lock_path(dataset: &Path) -> PathBuf {
        let mut path = dataset.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Acquires the lock guarding `dataset`
    ///
    /// # Arguments
    ///
    /// * `dataset` - Path of the dataset being protected
    /// * `timeout` - `None` blocks until the lock is free; `Some` polls and gives up
    ///
    /// # Returns
    ///
    /// * `Ok(DatasetLock)` - Lock held until the guard is dropped
    /// * `Err(DatasetError::LockTimeout)` - Another merger held the lock for the whole wait
    pub fn acquire(dataset: &Path, timeout: Option<Duration>) -> DatasetResult<Self> {
        let path = Self::lock_path(dataset);
        crate::fsutil::ensure_parent_dir(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match timeout {
            None => file.lock()?,
            Some(timeout) => Self::lock_with_timeout(&file, &path, timeout)?,
        }

        tracing::trace!("Acquired dataset lock {}", path.display());
        Ok(Self { file, path })
    }

    fn lock_with_timeout(file: &File, path: &Path, timeout: Duration) -> DatasetResult<()> {
        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(()),
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= timeout {
                        return Err(DatasetError::LockTimeout {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock too; unlocking first keeps the
        // release immediate even if the handle outlives us somewhere
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release dataset lock {}: {}", self.path.display(), e);
        }
    }
}
