//! Turning fetched payloads into records

use crate::config::{ExtractConfig, FieldRule};
use crate::dataset::Record;
use crate::pipeline::WorkUnit;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

/// Errors raised while extracting records from a payload
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Payload of {url} is not valid UTF-8")]
    Encoding { url: String },
}

/// Page-specific parsing supplied to the pipeline
///
/// Runs synchronously on the worker; implementations must not block on I/O.
pub trait Extractor: Send + Sync {
    /// Extracts zero or more records from one fetched payload
    fn extract(&self, unit: &WorkUnit, payload: &[u8]) -> Result<Vec<Record>, ExtractError>;
}

/// Field name holding the URL a record was extracted from
pub const SOURCE_URL_FIELD: &str = "source_url";

/// Field name holding the extraction timestamp
pub const SCRAPED_AT_FIELD: &str = "scraped_at";

struct CompiledField {
    name: String,
    selector: Option<Selector>,
    attribute: Option<String>,
}

/// Generic CSS-selector extractor
///
/// Every element matching the item selector becomes one record. Each field
/// reads the text (or an attribute) of the first element matching its own
/// selector inside the item. `href` and `src` attributes are resolved
/// against the page URL.
pub struct SelectorExtractor {
    item: Selector,
    fields: Vec<CompiledField>,
    /// Field filled from `WorkUnit::key` when the page does not provide it
    unit_key_field: Option<String>,
}

impl SelectorExtractor {
    pub fn new(item_selector: &str, fields: &[(String, FieldRule)]) -> Result<Self, ExtractError> {
        let item = compile(item_selector)?;
        let fields = fields
            .iter()
            .map(|(name, rule)| {
                Ok(CompiledField {
                    name: name.clone(),
                    selector: rule.selector.as_deref().map(compile).transpose()?,
                    attribute: rule.attribute.clone(),
                })
            })
            .collect::<Result<Vec<_>, ExtractError>>()?;

        Ok(Self {
            item,
            fields,
            unit_key_field: None,
        })
    }

    pub fn from_config(config: &ExtractConfig) -> Result<Self, ExtractError> {
        let fields: Vec<(String, FieldRule)> = config
            .fields
            .iter()
            .map(|(name, rule)| (name.clone(), rule.clone()))
            .collect();
        Self::new(&config.item_selector, &fields)
    }

    /// Stamps the unit's key into `field` on records that lack it
    pub fn with_unit_key(mut self, field: impl Into<String>) -> Self {
        self.unit_key_field = Some(field.into());
        self
    }

    fn read_field(
        &self,
        item: ElementRef<'_>,
        field: &CompiledField,
        base: Option<&Url>,
    ) -> Option<String> {
        let element = match &field.selector {
            Some(selector) => item.select(selector).next()?,
            None => item,
        };

        let value = match &field.attribute {
            Some(attribute) => {
                let raw = element.value().attr(attribute)?.trim();
                match (attribute.as_str(), base) {
                    ("href" | "src", Some(base)) => base
                        .join(raw)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| raw.to_string()),
                    _ => raw.to_string(),
                }
            }
            None => collapse_whitespace(&element.text().collect::<String>()),
        };

        Some(value)
    }
}

impl Extractor for SelectorExtractor {
    fn extract(&self, unit: &WorkUnit, payload: &[u8]) -> Result<Vec<Record>, ExtractError> {
        let html = std::str::from_utf8(payload).map_err(|_| ExtractError::Encoding {
            url: unit.target.clone(),
        })?;
        let document = Html::parse_document(html);
        let base = Url::parse(&unit.target).ok();
        let scraped_at = Utc::now().to_rfc3339();

        let records: Vec<Record> = document
            .select(&self.item)
            .map(|item| {
                let mut record = Record::new();
                for field in &self.fields {
                    if let Some(value) = self.read_field(item, field, base.as_ref()) {
                        record.set(field.name.clone(), value);
                    }
                }

                if let (Some(field), Some(key)) = (&self.unit_key_field, &unit.key) {
                    if record.get(field).is_none() {
                        record.set(field.clone(), key.clone());
                    }
                }

                record.set(SOURCE_URL_FIELD, unit.target.clone());
                record.set(SCRAPED_AT_FIELD, scraped_at.clone());
                record
            })
            .collect();

        if records.is_empty() {
            tracing::debug!("No items matched on {}", unit.target);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for SelectorExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorExtractor")
            .field("fields", &self.fields.iter().map(|c| &c.name).collect::<Vec<_>>())
            .field("unit_key_field", &self.unit_key_field)
            .finish()
    }
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        reason: format!("{:?}", e),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
