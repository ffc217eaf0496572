//! Pipeline orchestrator.
//!
//! Composes fetcher → enrichers → transformer for one run. Exactly three
//! phases; each reads the output of the previous one. Enricher failures are
//! soft (logged into the run's error list, next enricher proceeds); fetcher
//! failures are run-fatal. Statistics accumulate up to the failure point and
//! travel with the error.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rex_core::{
    Catalog, EngineError, EnrichContext, EnricherStat, ExportConfig, FetchRequest, RateQuoter,
    RunStats, UpstreamApi, Value,
};
use rex_io::dicts::{load_dictionaries, DictionaryNeeds};
use rex_io::FetcherRegistry;
use rex_tx::{EnricherRegistry, Table, Transformer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a finished run hands back to the dispatcher.
#[derive(Debug)]
pub struct PipelineOutput {
    pub table: Table,
    pub stats: RunStats,
    /// Soft failures; non-empty on a succeeded run means partial data.
    pub errors: Vec<String>,
}

/// A failed run still carries the statistics gathered before the failure.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: EngineError,
    pub stats: RunStats,
}

/// Counts upstream calls so per-enricher stats can be derived from deltas.
struct CountingApi<'a> {
    inner: &'a dyn UpstreamApi,
    calls: AtomicU64,
}

impl<'a> CountingApi<'a> {
    fn new(inner: &'a dyn UpstreamApi) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
        }
    }

    fn count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UpstreamApi for CountingApi<'_> {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.call(method, params).await
    }
}

pub struct Pipeline<'a> {
    pub config: &'a ExportConfig,
    pub catalog: &'a Catalog,
    pub fetchers: &'a FetcherRegistry,
    pub enrichers: &'a EnricherRegistry,
    pub api: &'a dyn UpstreamApi,
    pub rates: &'a dyn RateQuoter,
    pub cancel: CancellationToken,
}

impl Pipeline<'_> {
    pub async fn execute(&self) -> Result<PipelineOutput, PipelineFailure> {
        let run_start = Instant::now();
        let mut stats = RunStats::default();
        let mut errors: Vec<String> = Vec::new();

        // empty selection: nothing to fetch, enrich, or emit
        if self.config.selected_fields.is_empty() {
            return Ok(PipelineOutput {
                table: Table {
                    headers: Vec::new(),
                    rows: Vec::new(),
                },
                stats,
                errors,
            });
        }

        let api = CountingApi::new(self.api);
        let fail = |error: EngineError, stats: &RunStats| PipelineFailure {
            error,
            stats: stats.clone(),
        };

        // FETCH
        let fetcher = self
            .fetchers
            .get(&self.config.dataset)
            .ok_or_else(|| {
                fail(
                    EngineError::Configuration(format!(
                        "no fetcher registered for dataset '{}'",
                        self.config.dataset
                    )),
                    &stats,
                )
            })?;
        let phase_start = Instant::now();
        let request = FetchRequest {
            filters: &self.config.filters,
            cancel: &self.cancel,
        };
        let mut records = fetcher
            .fetch(&api, &request)
            .await
            .map_err(|e| fail(e, &stats))?;
        stats.fetch_ms = phase_start.elapsed().as_millis() as u64;
        stats.fetched_records = records.len() as u64;
        info!(
            config = %self.config.id,
            records = records.len(),
            ms = stats.fetch_ms,
            "fetch phase complete"
        );

        let needs = DictionaryNeeds::from_selected(&self.config.selected_fields);
        let dicts = if needs.any() && !records.is_empty() {
            match load_dictionaries(&api, needs).await {
                Ok(dicts) => dicts,
                Err(e) => {
                    errors.push(format!("dictionaries: {e}"));
                    Default::default()
                }
            }
        } else {
            Default::default()
        };

        // ENRICH, skipped entirely on an empty fetch
        if !records.is_empty() {
            let required = self
                .catalog
                .required_enrichments(
                    &self.config.dataset,
                    &self.config.selected_fields,
                    self.config.wants_currency(),
                )
                .map_err(|e| fail(e, &stats))?;
            let ctx = EnrichContext {
                api: &api,
                rates: self.rates,
                catalog: self.catalog,
                config: self.config,
                cancel: &self.cancel,
            };
            let phase_start = Instant::now();
            for tag in required {
                if self.cancel.is_cancelled() {
                    return Err(fail(EngineError::Canceled, &stats));
                }
                let Some(enricher) = self.enrichers.get(tag) else {
                    errors.push(format!("{tag}: no enricher registered"));
                    continue;
                };
                let calls_before = api.count();
                let enricher_start = Instant::now();
                match enricher.enrich(&mut records, &ctx).await {
                    Ok(report) => errors.extend(report.warnings),
                    // cancellation is not a soft failure
                    Err(EngineError::Canceled) => {
                        return Err(fail(EngineError::Canceled, &stats))
                    }
                    Err(e) => {
                        warn!(%tag, error = %e, "enricher failed, continuing");
                        errors.push(format!("{tag}: {e}"));
                    }
                }
                stats.enrichers.push(EnricherStat {
                    tag: tag.to_string(),
                    upstream_calls: api.count() - calls_before,
                    duration_ms: enricher_start.elapsed().as_millis() as u64,
                });
            }
            stats.enrich_ms = phase_start.elapsed().as_millis() as u64;
        }

        // TRANSFORM
        let phase_start = Instant::now();
        let transformer = Transformer::from_config(self.catalog, self.config, dicts)
            .map_err(|e| fail(e, &stats))?;
        let table = transformer.transform(&records);
        stats.transform_ms = phase_start.elapsed().as_millis() as u64;
        stats.output_rows = table.rows.len() as u64;
        stats.upstream_calls = api.count();
        stats.wall_ms = run_start.elapsed().as_millis() as u64;
        info!(
            config = %self.config.id,
            rows = stats.output_rows,
            upstream_calls = stats.upstream_calls,
            wall_ms = stats.wall_ms,
            soft_errors = errors.len(),
            "pipeline complete"
        );

        Ok(PipelineOutput {
            table,
            stats,
            errors,
        })
    }
}
