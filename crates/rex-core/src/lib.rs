//! # REX Core - Export Engine Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for
//! the REX export pipeline. It defines the record value model, the dataset &
//! capability catalog, export configurations, run records, and the trait
//! seams the engine composes at runtime.
//!
//! ## Key Components
//!
//! - **Value Model**: Records flow as JSON maps from field key to value
//! - **Catalog**: Static dataset descriptions plus capability derivation
//! - **Operator Traits**: Fetcher and Enricher abstractions for the pipeline
//! - **Seams**: Upstream API, rate quoter, sheet writer, config & run stores
//! - **Error Handling**: One classified error enum for the whole engine
//!
//! ## Example Usage
//!
//! ```rust
//! use rex_core::{Catalog, Enrichment};
//!
//! let catalog = Catalog::builtin();
//! let required = catalog
//!     .required_enrichments("orders", &["pkg1_tracking_number".into()], false)
//!     .unwrap();
//! assert_eq!(required, vec![Enrichment::Packages]);
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod run;
pub mod traits;
pub mod value;

pub use catalog::{
    Catalog, DatasetDef, Dictionaries, Enrichment, ExtraPrefix, FieldDef, FieldGroup, FieldType,
    DOCUMENT_SLOTS, PACKAGE_SLOTS,
};
pub use config::{
    CurrencyConversion, CustomField, ExportConfig, Formatting, RateAnchor, WriteMode,
};
pub use error::EngineError;
pub use run::{
    BeginRun, EnricherStat, MemoryRunStore, RunRecord, RunState, RunStats, RunStore, RunTrigger,
};
pub use traits::{
    ConfigStore, EnrichContext, EnrichReport, Enricher, FetchRequest, Fetcher, MemoryConfigStore,
    RateQuote, RateQuoter, SheetWriter, UpstreamApi,
};
pub use value::{Record, Value};
