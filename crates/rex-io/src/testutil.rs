//! Hand-rolled upstream mock for fetcher tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rex_core::{EngineError, UpstreamApi, Value};

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
