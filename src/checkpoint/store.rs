use crate::checkpoint::CheckpointError;
use crate::config::{CheckpointConfig, CorruptionPolicy};
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resumption point of a run
///
/// Units are numbered from zero. `Completed(n)` means every unit up to and
/// including `n` is durably merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum Cursor {
    /// Nothing has been completed yet
    Start,
    Completed(u64),
}

impl Cursor {
    /// First unit a run starting from this cursor has to process
    pub fn next_unit(self) -> u64 {
        match self {
            Self::Start => 0,
            Self::Completed(n) => n + 1,
        }
    }

    /// Whether the unit is covered by this cursor
    pub fn covers(self, seq: u64) -> bool {
        seq < self.next_unit()
    }
}

impl From<Option<u64>> for Cursor {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Start, Self::Completed)
    }
}

impl From<Cursor> for Option<u64> {
    fn from(cursor: Cursor) -> Self {
        match cursor {
            Cursor::Start => None,
            Cursor::Completed(n) => Some(n),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Completed(n) => write!(f, "{}", n),
        }
    }
}

/// On-disk checkpoint record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
    /// Hash of the configuration the cursor was produced under
    #[serde(default)]
    pub config_hash: Option<String>,
}

/// Durable single-writer cursor file
///
/// `advance` writes the whole record to a temporary file, fsyncs it and
/// renames it over the checkpoint, so `load` after a crash returns exactly the
/// last value passed to `advance`.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    on_corrupt: CorruptionPolicy,
    config_hash: Option<String>,
    cursor: Cursor,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, on_corrupt: CorruptionPolicy) -> Self {
        Self {
            path: path.into(),
            on_corrupt,
            config_hash: None,
            cursor: Cursor::Start,
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self::new(config.path.clone(), config.on_corrupt)
    }

    /// Records the configuration hash written with every checkpoint
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor as of the last `load` or `advance`
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Reads the checkpoint, returning `Cursor::Start` when none exists
    ///
    /// # Returns
    ///
    /// * `Ok(Cursor)` - The persisted cursor, or `Start`
    /// * `Err(CheckpointError::Corrupt)` - The file is unreadable and the policy is `Fail`
    pub fn load(&mut self) -> Result<Cursor, CheckpointError> {
        let checkpoint = match Self::read(&self.path) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                tracing::info!("No checkpoint at {}, starting fresh", self.path.display());
                self.cursor = Cursor::Start;
                return Ok(self.cursor);
            }
            Err(CheckpointError::Corrupt { path, reason }) => {
                return self.recover_from_corruption(path, reason);
            }
            Err(e) => return Err(e),
        };

        if let (Some(stored), Some(current)) = (&checkpoint.config_hash, &self.config_hash) {
            if stored != current {
                tracing::warn!(
                    "Configuration changed since the checkpoint was written ({}); resuming anyway",
                    checkpoint.updated_at
                );
            }
        }

        tracing::info!(
            "Resuming from checkpoint {} (cursor {}, written {})",
            self.path.display(),
            checkpoint.cursor,
            checkpoint.updated_at
        );
        self.cursor = checkpoint.cursor;
        Ok(self.cursor)
    }

    /// Durably moves the cursor to `completed`
    ///
    /// Re-writing the current value is allowed; moving backwards is not.
    pub fn advance(&mut self, completed: u64) -> Result<(), CheckpointError> {
        if let Cursor::Completed(current) = self.cursor {
            if completed < current {
                return Err(CheckpointError::Regression {
                    current,
                    requested: completed,
                });
            }
        }

        let checkpoint = Checkpoint {
            cursor: Cursor::Completed(completed),
            updated_at: Utc::now(),
            config_hash: self.config_hash.clone(),
        };

        fsutil::write_atomically(&self.path, |file| -> Result<(), CheckpointError> {
            serde_json::to_writer_pretty(&mut *file, &checkpoint)?;
            file.write_all(b"\n")?;
            Ok(())
        })?;

        self.cursor = checkpoint.cursor;
        tracing::debug!("Checkpoint advanced to {}", completed);
        Ok(())
    }

    /// Deletes the checkpoint file so the next run starts over
    pub fn reset(&mut self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Removed checkpoint {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cursor = Cursor::Start;
        Ok(())
    }

    /// Reads a checkpoint file without applying any policy
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Checkpoint))` - The file parsed
    /// * `Ok(None)` - No file at `path`
    /// * `Err(CheckpointError::Corrupt)` - The file exists but cannot be parsed
    pub fn read(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn recover_from_corruption(
        &mut self,
        path: PathBuf,
        reason: String,
    ) -> Result<Cursor, CheckpointError> {
        match self.on_corrupt {
            CorruptionPolicy::Fail => Err(CheckpointError::Corrupt { path, reason }),
            CorruptionPolicy::Restart => {
                let mut aside = path.clone().into_os_string();
                aside.push(".corrupt");
                let aside = PathBuf::from(aside);
                fs::rename(&path, &aside)?;

                tracing::error!(
                    "Checkpoint {} is corrupt ({}); moved to {} and restarting from the first unit",
                    path.display(),
                    reason,
                    aside.display()
                );
                self.cursor = Cursor::Start;
                Ok(self.cursor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("checkpoint.json"), CorruptionPolicy::Fail)
    }

    #[test]
    fn test_missing_file_loads_start() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);

        assert_eq!(store.load().unwrap(), Cursor::Start);
        assert_eq!(Cursor::Start.next_unit(), 0);
    }

    #[test]
    fn test_advance_then_load_returns_last_value() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.advance(3).unwrap();
        store.advance(7).unwrap();

        // A fresh store simulates a restarted process
        let mut reopened = create_test_store(&dir);
        assert_eq!(reopened.load().unwrap(), Cursor::Completed(7));
        assert_eq!(reopened.cursor().next_unit(), 8);
    }

    #[test]
    fn test_advance_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for n in 0..5 {
            store.advance(n).unwrap();
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_regression_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.advance(5).unwrap();

        assert!(matches!(
            store.advance(4),
            Err(CheckpointError::Regression {
                current: 5,
                requested: 4
            })
        ));
        assert!(store.advance(5).is_ok());
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir).with_config_hash("abc123");
        store.advance(2).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(value["cursor"], 2);
        assert_eq!(value["config_hash"], "abc123");
        assert!(value["updated_at"].is_string());
    }

    #[test]
    fn test_null_cursor_is_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(
            &path,
            r#"{"cursor": null, "updated_at": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let mut store = CheckpointStore::new(&path, CorruptionPolicy::Fail);
        assert_eq!(store.load().unwrap(), Cursor::Start);
    }

    #[test]
    fn test_corrupt_file_fails_by_default() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        fs::write(store.path(), b"{\"cursor\": 4, \"upd").unwrap();

        assert!(matches!(store.load(), Err(CheckpointError::Corrupt { .. })));
        // The evidence stays where it was
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file_restart_policy_moves_it_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, b"garbage").unwrap();

        let mut store = CheckpointStore::new(&path, CorruptionPolicy::Restart);

        assert_eq!(store.load().unwrap(), Cursor::Start);
        assert!(!path.exists());
        assert!(dir.path().join("checkpoint.json.corrupt").exists());
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.advance(1).unwrap();

        store.reset().unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.cursor(), Cursor::Start);

        // Resetting twice is fine
        store.reset().unwrap();
    }

    #[test]
    fn test_cursor_ordering_and_coverage() {
        assert!(Cursor::Start < Cursor::Completed(0));
        assert!(Cursor::Completed(3).covers(3));
        assert!(!Cursor::Completed(3).covers(4));
        assert!(!Cursor::Start.covers(0));
    }
}
