//! Upstream commerce API client.
//!
//! One HTTP POST per upstream method: form fields `method` and `parameters`
//! (JSON-encoded), the tenant token under `X-API-TOKEN`, JSON response
//! demanded. Every call acquires a slot from the token's rate budget first,
//! then retries transient failures with exponential backoff and jitter.
//! Raw response bodies never leak to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rex_core::{EngineError, UpstreamApi, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::RateBudget;

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Per-tenant-token client. Cheap to construct; the budget is the shared
/// part.
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    budget: Arc<RateBudget>,
    cancel: CancellationToken,
}

impl UpstreamClient {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        budget: Arc<RateBudget>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
            budget,
            cancel: CancellationToken::new(),
        })
    }

    /// Attach the run's cancellation token; budget waits and retry backoffs
    /// return promptly once it fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, EngineError> {
        let parameters = serde_json::to_string(params)
            .map_err(|e| EngineError::Transport(format!("encode parameters: {e}")))?;
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-API-TOKEN", &self.token)
            .form(&[("method", method), ("parameters", parameters.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::UpstreamServer(status.as_u16()));
        }
        if status.as_u16() == 429 {
            return Err(EngineError::RateLimited);
        }
        if status.is_client_error() {
            return Err(EngineError::UpstreamClient {
                code: status.as_u16().to_string(),
                message: "request rejected".to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(format!("decode response: {e}")))?;
        classify_envelope(body)
    }
}

/// Map the upstream `{"status": ...}` envelope to a typed result.
fn classify_envelope(body: Value) -> Result<Value, EngineError> {
    if body.get("status").and_then(Value::as_str) == Some("ERROR") {
        let code = body
            .get("error_code")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        if code == "RATE_LIMIT_EXCEEDED" {
            return Err(EngineError::RateLimited);
        }
        let message = body
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .chars()
            .take(200)
            .collect();
        return Err(EngineError::UpstreamClient { code, message });
    }
    Ok(body)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..250);
    exp + Duration::from_millis(jitter)
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let start = Instant::now();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            self.budget.acquire(&self.cancel).await?;
            debug!(method, attempt, "upstream call");
            match self.call_once(method, &params).await {
                Ok(body) => break Ok(body),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(method, attempt, error = %e, delay_ms = delay.as_millis() as u64,
                        "transient upstream failure, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Err(EngineError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        metrics::counter!("rex_upstream_calls_total", 1, "method" => method.to_string());
        metrics::histogram!(
            "rex_upstream_call_seconds",
            start.elapsed().as_secs_f64(),
            "method" => method.to_string()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_passes_through() {
        let body = json!({"status": "SUCCESS", "orders": [{"order_id": 1}]});
        let out = classify_envelope(body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn error_envelope_maps_to_client_error() {
        let body = json!({"status": "ERROR", "error_code": "ERROR_ORDER_NOT_FOUND",
            "error_message": "no such order"});
        match classify_envelope(body).unwrap_err() {
            EngineError::UpstreamClient { code, message } => {
                assert_eq!(code, "ERROR_ORDER_NOT_FOUND");
                assert_eq!(message, "no such order");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_code_maps_to_rate_limited() {
        let body = json!({"status": "ERROR", "error_code": "RATE_LIMIT_EXCEEDED"});
        assert!(matches!(
            classify_envelope(body).unwrap_err(),
            EngineError::RateLimited
        ));
    }

    #[test]
    fn backoff_grows_per_attempt() {
        assert!(backoff_delay(1) < backoff_delay(3));
        assert!(backoff_delay(3) >= Duration::from_secs(2));
    }
}
