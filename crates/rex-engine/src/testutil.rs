//! Shared mocks for orchestrator and dispatcher tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rex_core::{
    Catalog, EngineError, ExportConfig, FetchRequest, Fetcher, MemoryConfigStore, MemoryRunStore,
    RateQuote, RateQuoter, Record, SheetWriter, UpstreamApi, Value, WriteMode,
};
use rex_io::FetcherRegistry;
use rex_tx::EnricherRegistry;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{ApiFactory, DispatchOptions, Dispatcher};

/// Queued canned responses per method, recording every call made.
#[derive(Default)]
pub struct MockApi {
    responses: Mutex<HashMap<String, VecDeque<Value>>>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, method: &str, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(body);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}

#[async_trait]
impl UpstreamApi for MockApi {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        self.responses
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| EngineError::UpstreamClient {
                code: "MOCK_EXHAUSTED".to_string(),
                message: format!("no canned response left for {method}"),
            })
    }
}

/// Factory handing every run the same shared mock.
pub struct MockApiFactory {
    pub api: Arc<MockApi>,
}

impl ApiFactory for MockApiFactory {
    fn for_run(
        &self,
        _config: &ExportConfig,
        _cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamApi>, EngineError> {
        Ok(self.api.clone())
    }
}

/// Rate quoter pinned at 1.0.
pub struct UnitRates;

#[async_trait]
impl RateQuoter for UnitRates {
    async fn rate(
        &self,
        _source: &str,
        _target: &str,
        date: NaiveDate,
    ) -> Result<RateQuote, EngineError> {
        Ok(RateQuote {
            rate: 1.0,
            effective_date: date,
        })
    }
}

/// Sheet writer keeping every delivery in memory.
#[derive(Default)]
pub struct MemoryWriter {
    pub writes: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl SheetWriter for MemoryWriter {
    async fn write(
        &self,
        destination: &str,
        _headers: &[String],
        rows: &[Vec<String>],
        _mode: WriteMode,
    ) -> Result<u64, EngineError> {
        self.writes
            .lock()
            .unwrap()
            .push((destination.to_string(), rows.len()));
        Ok(rows.len() as u64)
    }
}

/// Sheet writer that always refuses.
pub struct FailingWriter;

#[async_trait]
impl SheetWriter for FailingWriter {
    async fn write(
        &self,
        _destination: &str,
        _headers: &[String],
        _rows: &[Vec<String>],
        _mode: WriteMode,
    ) -> Result<u64, EngineError> {
        Err(EngineError::Writer("destination refused the write".to_string()))
    }
}

/// Orders fetcher that sleeps before producing one record; cancels cleanly.
pub struct SlowFetcher(pub Duration);

#[async_trait]
impl Fetcher for SlowFetcher {
    fn dataset(&self) -> &'static str {
        "orders"
    }

    async fn fetch(
        &self,
        _api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        tokio::select! {
            _ = req.cancel.cancelled() => Err(EngineError::Canceled),
            _ = tokio::time::sleep(self.0) => {
                let mut record = Record::new();
                record.insert("order_id".into(), 1.into());
                Ok(vec![record])
            }
        }
    }
}

pub fn orders_export(id: &str) -> ExportConfig {
    ExportConfig {
        id: id.to_string(),
        tenant_id: "tenant-1".to_string(),
        api_token: "token-1".to_string(),
        dataset: "orders".to_string(),
        selected_fields: vec![
            "order_id".to_string(),
            "date_add".to_string(),
            "email".to_string(),
        ],
        filters: HashMap::new(),
        custom_headers: HashMap::new(),
        custom_fields: HashMap::new(),
        currency_conversion: None,
        schedule_minutes: 0,
        destination: "sheet://test".to_string(),
        write_mode: Default::default(),
        formatting: Default::default(),
        active: true,
    }
}

pub struct TestHarness {
    pub dispatcher: Arc<Dispatcher>,
    pub api: Arc<MockApi>,
    pub runs: Arc<MemoryRunStore>,
    pub writer: Arc<MemoryWriter>,
}

/// Dispatcher over in-memory stores and the shared mock API.
pub fn harness(configs: Vec<ExportConfig>) -> TestHarness {
    harness_with(configs, Arc::new(FetcherRegistry::builtin()), None)
}

pub fn harness_with(
    configs: Vec<ExportConfig>,
    fetchers: Arc<FetcherRegistry>,
    writer_override: Option<Arc<dyn SheetWriter>>,
) -> TestHarness {
    let api = Arc::new(MockApi::new());
    let runs = Arc::new(MemoryRunStore::new());
    let writer = Arc::new(MemoryWriter::default());
    let dispatcher = Dispatcher::new(
        Arc::new(Catalog::builtin()),
        fetchers,
        Arc::new(EnricherRegistry::builtin()),
        Arc::new(MemoryConfigStore::new(configs)),
        runs.clone(),
        writer_override.unwrap_or_else(|| writer.clone()),
        Arc::new(UnitRates),
        Arc::new(MockApiFactory { api: api.clone() }),
        DispatchOptions::default(),
    );
    TestHarness {
        dispatcher: Arc::new(dispatcher),
        api,
        runs,
        writer,
    }
}
