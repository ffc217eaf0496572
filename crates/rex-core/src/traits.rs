//! Trait seams between the engine and its collaborators.
//!
//! Fetchers and enrichers are polymorphic over these traits so the
//! orchestrator can compose variable graphs from the user's column
//! selection, and so tests can substitute hand-rolled mocks for the
//! network-facing pieces.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::catalog::Enrichment;
use crate::config::{ExportConfig, WriteMode};
use crate::error::EngineError;
use crate::value::{Record, Value};

/// One HTTP call per upstream method. Implemented by the real client and by
/// test mocks; the orchestrator wraps it in a counting decorator for stats.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError>;
}

/// An exchange rate relative to the target currency, plus the date the
/// provider actually quoted (may differ from the requested date on
/// non-trading days).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateQuote {
    pub rate: f64,
    pub effective_date: NaiveDate,
}

/// Cross-currency rate lookup.
#[async_trait]
pub trait RateQuoter: Send + Sync {
    async fn rate(
        &self,
        source: &str,
        target: &str,
        date: NaiveDate,
    ) -> Result<RateQuote, EngineError>;
}

/// What a fetcher receives for one run.
pub struct FetchRequest<'a> {
    pub filters: &'a HashMap<String, Value>,
    pub cancel: &'a CancellationToken,
}

/// Produces the primary record stream for one dataset.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Dataset identifier this fetcher is registered under.
    fn dataset(&self) -> &'static str;

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError>;
}

/// What an enricher receives for one run.
pub struct EnrichContext<'a> {
    pub api: &'a dyn UpstreamApi,
    pub rates: &'a dyn RateQuoter,
    pub catalog: &'a crate::catalog::Catalog,
    pub config: &'a ExportConfig,
    pub cancel: &'a CancellationToken,
}

/// Soft failures an enricher recorded while still completing.
#[derive(Debug, Default)]
pub struct EnrichReport {
    pub warnings: Vec<String>,
}

impl EnrichReport {
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Augments a record set with related data from auxiliary endpoints.
///
/// Implementations must not change a record's existing non-null values
/// (use [`crate::value::set_if_absent`]); a single upstream error fills the
/// affected records with empty values for this enricher's keys and lands in
/// the report instead of aborting the run.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn tag(&self) -> Enrichment;

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError>;
}

/// Spreadsheet destination adapter. The engine stays ignorant of the
/// destination's protocol; this signature and the two write modes are the
/// whole contract.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Returns the number of rows written.
    async fn write(
        &self,
        destination: &str,
        headers: &[String],
        rows: &[Vec<String>],
        mode: WriteMode,
    ) -> Result<u64, EngineError>;
}

/// Read access to export configurations. The engine only reads.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, config_id: &str) -> Result<Option<ExportConfig>, EngineError>;

    /// Active configurations, for the scheduler tick.
    async fn active(&self) -> Result<Vec<ExportConfig>, EngineError>;
}

/// In-memory configuration store, filled at startup.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: HashMap<String, ExportConfig>,
}

impl MemoryConfigStore {
    pub fn new(configs: Vec<ExportConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, config_id: &str) -> Result<Option<ExportConfig>, EngineError> {
        Ok(self.configs.get(config_id).cloned())
    }

    async fn active(&self) -> Result<Vec<ExportConfig>, EngineError> {
        let mut active: Vec<ExportConfig> =
            self.configs.values().filter(|c| c.active).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}
