use crate::config::UnitsConfig;
use crate::ConfigError;
use std::fs::File;
use std::path::{Path, PathBuf};

/// One fetchable target
///
/// `seq` is the unit's position in the run and is what the checkpoint
/// cursor counts. Retries reuse the same unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub seq: u64,
    pub target: String,
    /// Dataset key the unit produces, when known up front (e.g. a product id)
    pub key: Option<String>,
}

impl WorkUnit {
    pub fn new(seq: u64, target: impl Into<String>) -> Self {
        Self {
            seq,
            target: target.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Where the run's work units come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    /// A listing URL template over an inclusive page range
    Pages {
        template: String,
        first: u64,
        last: u64,
    },
    /// A CSV file of targets, one unit per non-blank row
    Targets {
        path: PathBuf,
        url_column: String,
        key_column: Option<String>,
    },
}

impl UnitSource {
    pub fn from_config(config: &UnitsConfig) -> Result<Self, ConfigError> {
        match (&config.url_template, &config.targets_file) {
            (Some(template), None) => Ok(Self::Pages {
                template: template.clone(),
                first: config.first_page,
                last: config.last_page.ok_or_else(|| {
                    ConfigError::Validation("url_template requires last_page".to_string())
                })?,
            }),
            (None, Some(path)) => Ok(Self::Targets {
                path: path.clone(),
                url_column: config.url_column.clone(),
                key_column: config.key_column.clone(),
            }),
            _ => Err(ConfigError::Validation(
                "units must set exactly one of url_template or targets_file".to_string(),
            )),
        }
    }

    /// Enumerates the units in sequence order
    pub fn load(&self) -> Result<Vec<WorkUnit>, ConfigError> {
        match self {
            Self::Pages {
                template,
                first,
                last,
            } => Ok((*first..=*last)
                .enumerate()
                .map(|(seq, page)| {
                    WorkUnit::new(seq as u64, template.replace("{page}", &page.to_string()))
                })
                .collect()),
            Self::Targets {
                path,
                url_column,
                key_column,
            } => load_targets(path, url_column, key_column.as_deref()),
        }
    }
}

fn load_targets(
    path: &Path,
    url_column: &str,
    key_column: Option<&str>,
) -> Result<Vec<WorkUnit>, ConfigError> {
    let invalid = |reason: String| {
        ConfigError::Validation(format!("targets file {}: {}", path.display(), reason))
    };

    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let headers = reader.headers().map_err(|e| invalid(e.to_string()))?.clone();

    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| invalid(format!("missing column '{}'", column)))
    };
    let url_index = position(url_column)?;
    let key_index = key_column.map(position).transpose()?;

    let mut units = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| invalid(e.to_string()))?;
        let target = row.get(url_index).unwrap_or("").trim();
        if target.is_empty() {
            continue;
        }

        let mut unit = WorkUnit::new(units.len() as u64, target);
        if let Some(key) = key_index.and_then(|i| row.get(i)).map(str::trim) {
            if !key.is_empty() {
                unit = unit.with_key(key);
            }
        }
        units.push(unit);
    }

    tracing::info!("Loaded {} targets from {}", units.len(), path.display());
    Ok(units)
}
