//! Shared hand-rolled mocks for enricher tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use rex_core::{
    Catalog, EngineError, EnrichContext, ExportConfig, RateQuote, RateQuoter, UpstreamApi, Value,
};
use tokio_util::sync::CancellationToken;

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

/// Rate quoter returning one fixed rate, optionally shifted to an earlier
/// effective date, or failing outright.
pub struct FixedRates {
    pub rate: f64,
    pub effective: Option<NaiveDate>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FixedRates {
    pub fn at(rate: f64) -> Self {
        Self {
            rate,
            effective: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            rate: 0.0,
            effective: None,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateQuoter for FixedRates {
    async fn rate(
        &self,
        source: &str,
        _target: &str,
        date: NaiveDate,
    ) -> Result<RateQuote, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::RateUnavailable {
                currency: source.to_string(),
                date,
            });
        }
        Ok(RateQuote {
            rate: self.rate,
            effective_date: self.effective.unwrap_or(date),
        })
    }
}

/// Everything an [`EnrichContext`] borrows, bundled for tests.
pub struct TestCtx {
    pub api: MockApi,
    pub rates: FixedRates,
    pub catalog: Catalog,
    pub config: ExportConfig,
    pub cancel: CancellationToken,
}

impl TestCtx {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            api: MockApi::new(),
            rates: FixedRates::at(1.0),
            catalog: Catalog::builtin(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn ctx(&self) -> EnrichContext<'_> {
        EnrichContext {
            api: &self.api,
            rates: &self.rates,
            catalog: &self.catalog,
            config: &self.config,
            cancel: &self.cancel,
        }
    }
}

/// Minimal orders-dataset configuration.
pub fn orders_config() -> ExportConfig {
    ExportConfig {
        id: "exp-test".to_string(),
        tenant_id: "tenant-1".to_string(),
        api_token: "token-1".to_string(),
        dataset: "orders".to_string(),
        selected_fields: Vec::new(),
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
