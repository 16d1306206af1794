//! CSV dataset backend

use crate::dataset::traits::DatasetStore;
use crate::dataset::{Dataset, DatasetError, DatasetResult, Record};
use crate::fsutil;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Flat CSV file with a header row
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn corrupt(&self, error: csv::Error) -> DatasetError {
        DatasetError::Corrupt {
            path: self.path.clone(),
            reason: error.to_string(),
        }
    }
}

impl DatasetStore for CsvStore {
    fn load(&self) -> DatasetResult<Dataset> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Dataset::default()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::Reader::from_reader(file);
        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| self.corrupt(e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| self.corrupt(e))?;
            rows.push(Record::from_pairs(
                columns.iter().map(String::as_str).zip(row.iter()),
            ));
        }

        tracing::debug!("Loaded {} rows from {}", rows.len(), self.path.display());
        Ok(Dataset::new(columns, rows))
    }

    fn replace(&self, dataset: &Dataset) -> DatasetResult<()> {
        fsutil::write_atomically(&self.path, |file| -> DatasetResult<()> {
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(&dataset.columns)?;
            for row in &dataset.rows {
                writer.write_record(
                    dataset
                        .columns
                        .iter()
                        .map(|column| row.get(column).unwrap_or("")),
                )?;
            }
            writer.flush()?;
            Ok(())
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
