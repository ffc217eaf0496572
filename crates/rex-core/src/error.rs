//! Error types for the export engine.
//!
//! One enum covers every failure the engine classifies. The orchestrator's
//! propagation policy depends on these variants: fetch-phase upstream errors
//! are run-fatal, the same errors during enrichment are soft failures, and
//! `RateUnavailable` degrades to a unit rate inside the currency enricher.

use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown dataset, missing fetcher registration, or a required option
    /// absent from the export configuration. Fails the run before FETCH.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network-level failure talking to the upstream API.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream API reported its rate limit even after local pacing.
    #[error("upstream rate limited")]
    RateLimited,

    /// The upstream API rejected the call; not retryable.
    #[error("upstream rejected call ({code}): {message}")]
    UpstreamClient { code: String, message: String },

    /// The upstream API answered with a 5xx status.
    #[error("upstream server error (status {0})")]
    UpstreamServer(u16),

    /// No exchange rate could be produced at all, even after the backward
    /// walk and the latest-rate fallback.
    #[error("no exchange rate for {currency} on {date}")]
    RateUnavailable { currency: String, date: NaiveDate },

    /// The spreadsheet writer adapter failed.
    #[error("spreadsheet writer failed: {0}")]
    Writer(String),

    /// The dispatcher's wall-clock ceiling was breached.
    #[error("run exceeded its wall-clock limit")]
    TimeoutExceeded,

    /// External cancellation arrived before the run finished.
    #[error("run canceled")]
    Canceled,

    /// Synthesized by the sweeper for runs stuck past the staleness
    /// threshold.
    #[error("run stuck past the staleness threshold")]
    StuckRun,
}

impl EngineError {
    /// Errors worth retrying at the client level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::RateLimited | EngineError::UpstreamServer(_)
        )
    }
}
