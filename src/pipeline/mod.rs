//! Ingestion pipeline
//!
//! # Components
//!
//! - `WorkUnit` / `UnitSource`: what to fetch, in which order
//! - `Extractor`: payload to records; `SelectorExtractor` is the CSS-based default
//! - `Pipeline`: the resumable worker pool tying fetch, extract, merge and checkpoint together

mod coordinator;
mod extractor;
mod units;

pub use coordinator::{Pipeline, RunReport};
pub use extractor::{ExtractError, Extractor, SelectorExtractor, SCRAPED_AT_FIELD, SOURCE_URL_FIELD};
pub use units::{UnitSource, WorkUnit};
