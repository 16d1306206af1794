//! SQLite dataset backend

use crate::dataset::schema::initialize_schema;
use crate::dataset::traits::DatasetStore;
use crate::dataset::{Dataset, DatasetError, DatasetResult, Record};
use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};

/// Dataset kept in a single SQLite table keyed by the record key
///
/// A connection is opened per operation so the store can be shared between
/// threads; the dataset lock already serializes access.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    key_field: String,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, key_field: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key_field: key_field.into(),
        }
    }

    fn open(&self) -> DatasetResult<Connection> {
        crate::fsutil::ensure_parent_dir(&self.path)?;
        let conn = Connection::open(&self.path).map_err(|e| self.classify(e))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
        ",
        )
        .map_err(|e| self.classify(e))?;
        initialize_schema(&conn).map_err(|e| self.classify(e))?;
        Ok(conn)
    }

    /// A file that is not a database, or a damaged one, is corruption
    fn classify(&self, error: rusqlite::Error) -> DatasetError {
        match error {
            rusqlite::Error::SqliteFailure(failure, message)
                if matches!(
                    failure.code,
                    ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
                ) =>
            {
                DatasetError::Corrupt {
                    path: self.path.clone(),
                    reason: message.unwrap_or_else(|| failure.to_string()),
                }
            }
            other => DatasetError::Sqlite(other),
        }
    }
}

/// Column names and JSON-encoded rows, both in stored order
fn read_all(conn: &Connection) -> rusqlite::Result<(Vec<String>, Vec<String>)> {
    let mut stmt = conn.prepare("SELECT name FROM columns ORDER BY position")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT fields FROM records ORDER BY position")?;
    let encoded = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((columns, encoded))
}

impl DatasetStore for SqliteStore {
    fn load(&self) -> DatasetResult<Dataset> {
        if !self.exists() {
            return Ok(Dataset::default());
        }

        let conn = self.open()?;
        let (columns, encoded) = read_all(&conn).map_err(|e| self.classify(e))?;

        let rows = encoded
            .iter()
            .map(|json| serde_json::from_str::<Record>(json))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatasetError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Dataset::new(columns, rows))
    }

    fn replace(&self, dataset: &Dataset) -> DatasetResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction().map_err(|e| self.classify(e))?;

        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM columns", [])?;

        {
            let mut insert_column =
                tx.prepare("INSERT INTO columns (position, name) VALUES (?1, ?2)")?;
            for (position, name) in dataset.columns.iter().enumerate() {
                insert_column.execute(params![position as i64, name])?;
            }

            let mut insert_record = tx.prepare(
                "INSERT INTO records (row_key, position, fields) VALUES (?1, ?2, ?3)",
            )?;
            for (position, row) in dataset.rows.iter().enumerate() {
                let key = row.key(&self.key_field).ok_or_else(|| DatasetError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("row {} has no '{}' value", position, self.key_field),
                })?;
                let fields = serde_json::to_string(row)?;
                insert_record.execute(params![key, position as i64, fields])?;
            }
        }

        tx.commit().map_err(|e| self.classify(e))?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_and_load() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("reviews.db"), "review_id");
        let dataset = Dataset::new(
            vec!["review_id".into(), "rating".into()],
            vec![
                Record::from_pairs([("review_id", "R2"), ("rating", "4")]),
                Record::from_pairs([("review_id", "R1"), ("rating", "5")]),
            ],
        );

        store.replace(&dataset).unwrap();
        assert_eq!(store.load().unwrap(), dataset);

        // A second replace overwrites instead of appending
        let smaller = Dataset::new(dataset.columns.clone(), dataset.rows[..1].to_vec());
        store.replace(&smaller).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_keys_are_rejected_atomically() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("reviews.db"), "review_id");
        let good = Dataset::new(
            vec!["review_id".into()],
            vec![Record::from_pairs([("review_id", "R1")])],
        );
        store.replace(&good).unwrap();

        let duplicated = Dataset::new(
            vec!["review_id".into()],
            vec![
                Record::from_pairs([("review_id", "R2")]),
                Record::from_pairs([("review_id", "R2")]),
            ],
        );
        assert!(store.replace(&duplicated).is_err());

        // The failed transaction left the previous contents in place
        assert_eq!(store.load().unwrap(), good);
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reviews.db");
        std::fs::write(&path, vec![b'Z'; 4096]).unwrap();
        let store = SqliteStore::new(&path, "review_id");

        let loaded = store.load();
        assert!(matches!(loaded, Err(DatasetError::Corrupt { .. })), "{:?}", loaded);
        assert!(loaded.unwrap_err().is_fatal());

        let dataset = Dataset::new(
            vec!["review_id".into()],
            vec![Record::from_pairs([("review_id", "R1")])],
        );
        assert!(matches!(store.replace(&dataset), Err(DatasetError::Corrupt { .. })));

        // The damaged file is left for inspection
        assert_eq!(std::fs::read(&path).unwrap(), vec![b'Z'; 4096]);
    }

    #[test]
    fn test_missing_database_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("none.db"), "id");
        assert!(store.load().unwrap().is_empty());
        assert!(!store.exists());
    }
}
