//! Run dispatcher.
//!
//! Entry point for every run trigger, manual or scheduled. Deduplicates on
//! the caller-supplied `run_id`, enforces one live run per configuration,
//! applies the wall-clock ceiling, and hands finished tables to the sheet
//! writer. Run state lives in the [`RunStore`]; in a multi-worker deployment
//! that store is the shared lock keyed on the configuration id.

use std::sync::Arc;

use chrono::Utc;
use rex_core::{
    BeginRun, Catalog, ConfigStore, EngineError, ExportConfig, RateQuoter, RunRecord, RunState,
    RunStore, RunTrigger, SheetWriter, UpstreamApi,
};
use rex_io::{BudgetRegistry, FetcherRegistry, UpstreamClient};
use rex_tx::EnricherRegistry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, PipelineFailure, PipelineOutput};

/// Builds the upstream API handle for one run. The HTTP implementation
/// shares one rate budget per token; tests substitute mocks here.
pub trait ApiFactory: Send + Sync {
    fn for_run(
        &self,
        config: &ExportConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamApi>, EngineError>;
}

/// Production factory: one [`UpstreamClient`] per run, budget shared per
/// token through the registry.
pub struct HttpApiFactory {
    endpoint: String,
    budgets: BudgetRegistry,
}

impl HttpApiFactory {
    pub fn new(endpoint: impl Into<String>, budgets: BudgetRegistry) -> Self {
        Self {
            endpoint: endpoint.into(),
            budgets,
        }
    }
}

impl ApiFactory for HttpApiFactory {
    fn for_run(
        &self,
        config: &ExportConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamApi>, EngineError> {
        let budget = self.budgets.for_token(&config.api_token);
        Ok(Arc::new(
            UpstreamClient::new(&self.endpoint, &config.api_token, budget)?.with_cancel(cancel),
        ))
    }
}

/// One run trigger.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Client-supplied unique token, 128-bit.
    pub run_id: String,
    pub trigger: RunTrigger,
}

/// The run-status JSON callers receive.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    #[serde(flatten)]
    pub run: RunRecord,
    /// A previous outcome was returned without re-executing.
    pub cached: bool,
    /// The referenced run is still live.
    pub in_progress: bool,
    /// The referenced run has been live past the staleness threshold.
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Live runs older than this are exposed as stale.
    pub stale_after: chrono::Duration,
    /// Per-run wall-clock ceiling.
    pub run_timeout: std::time::Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(15),
            run_timeout: std::time::Duration::from_secs(600),
        }
    }
}

pub struct Dispatcher {
    catalog: Arc<Catalog>,
    fetchers: Arc<FetcherRegistry>,
    enrichers: Arc<EnricherRegistry>,
    configs: Arc<dyn ConfigStore>,
    runs: Arc<dyn RunStore>,
    writer: Arc<dyn SheetWriter>,
    rates: Arc<dyn RateQuoter>,
    api_factory: Arc<dyn ApiFactory>,
    options: DispatchOptions,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        fetchers: Arc<FetcherRegistry>,
        enrichers: Arc<EnricherRegistry>,
        configs: Arc<dyn ConfigStore>,
        runs: Arc<dyn RunStore>,
        writer: Arc<dyn SheetWriter>,
        rates: Arc<dyn RateQuoter>,
        api_factory: Arc<dyn ApiFactory>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            catalog,
            fetchers,
            enrichers,
            configs,
            runs,
            writer,
            rates,
            api_factory,
            options,
        }
    }

    pub fn configs(&self) -> &dyn ConfigStore {
        self.configs.as_ref()
    }

    pub fn runs(&self) -> &dyn RunStore {
        self.runs.as_ref()
    }

    /// Run Record lookup for the companion read API.
    pub async fn run_status(&self, run_id: &str) -> Result<Option<RunStatus>, EngineError> {
        Ok(self.runs.get(run_id).await?.map(|run| self.status_of(run)))
    }

    fn status_of(&self, run: RunRecord) -> RunStatus {
        let live = run.state.is_live();
        RunStatus {
            stale: run.is_stale(self.options.stale_after, Utc::now()),
            cached: !live,
            in_progress: live,
            run,
        }
    }

    /// Execute (or deduplicate) one run trigger.
    pub async fn run_export(
        &self,
        config_id: &str,
        request: RunRequest,
    ) -> Result<RunStatus, EngineError> {
        let config = self.configs.get(config_id).await?.ok_or_else(|| {
            EngineError::Configuration(format!("unknown export configuration '{config_id}'"))
        })?;

        let record = RunRecord::dispatched(
            &request.run_id,
            config_id,
            request.trigger,
            &config.destination,
        );
        match self.runs.begin(record.clone()).await? {
            BeginRun::Existing(existing) => {
                info!(run_id = %request.run_id, "duplicate run id, returning recorded outcome");
                return Ok(self.status_of(existing));
            }
            BeginRun::Busy { running_run_id } => {
                info!(
                    config = config_id,
                    live_run = %running_run_id,
                    "run already in progress for this configuration"
                );
                let live = self.runs.get(&running_run_id).await?.ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "live run '{running_run_id}' vanished from the store"
                    ))
                })?;
                return Ok(self.status_of(live));
            }
            BeginRun::Started => {}
        }

        let mut record = record;
        record.state = RunState::Running;
        self.runs.put(record.clone()).await?;
        info!(run_id = %record.run_id, config = config_id, trigger = ?record.trigger, "run started");

        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            self.options.run_timeout,
            self.execute(&config, cancel.clone()),
        )
        .await;

        record.finished_at = Some(Utc::now());
        match outcome {
            Err(_elapsed) => {
                cancel.cancel();
                warn!(run_id = %record.run_id, "run exceeded its wall-clock ceiling");
                record.state = RunState::Failed;
                record.error_message = Some(EngineError::TimeoutExceeded.to_string());
            }
            Ok(Err(PipelineFailure { error, stats })) => {
                error!(run_id = %record.run_id, error = %error, "run failed");
                record.state = RunState::Failed;
                record.error_message = Some(error.to_string());
                record.stats = Some(stats);
            }
            Ok(Ok(PipelineOutput {
                table,
                stats,
                errors,
            })) => {
                match self
                    .writer
                    .write(
                        &config.destination,
                        &table.headers,
                        &table.rows,
                        config.write_mode,
                    )
                    .await
                {
                    Ok(rows_written) => {
                        info!(run_id = %record.run_id, rows = rows_written, "run succeeded");
                        record.state = RunState::Succeeded;
                        record.row_count = Some(rows_written);
                        record.errors = errors;
                        record.stats = Some(stats);
                    }
                    Err(e) => {
                        error!(run_id = %record.run_id, error = %e, "sheet writer failed");
                        record.state = RunState::Failed;
                        record.error_message = Some(e.to_string());
                        record.stats = Some(stats);
                    }
                }
            }
        }
        self.runs.put(record.clone()).await?;

        Ok(RunStatus {
            run: record,
            cached: false,
            in_progress: false,
            stale: false,
        })
    }

    async fn execute(
        &self,
        config: &ExportConfig,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineFailure> {
        let api = self
            .api_factory
            .for_run(config, cancel.clone())
            .map_err(|error| PipelineFailure {
                error,
                stats: Default::default(),
            })?;
        let pipeline = Pipeline {
            config,
            catalog: &self.catalog,
            fetchers: &self.fetchers,
            enrichers: &self.enrichers,
            api: api.as_ref(),
            rates: self.rates.as_ref(),
            cancel,
        };
        pipeline.execute().await
    }
}
