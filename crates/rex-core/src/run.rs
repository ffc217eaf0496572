//! Run records and their persistence seam.
//!
//! A run is one attempt to execute a configuration end-to-end, identified by
//! a client-supplied 128-bit `run_id`. The dispatcher deduplicates on it, so
//! the store must be durable enough that a restart between "duplicate run_id
//! arrives" and "first run completes" does not lose the cache; anything
//! transactional keyed on `run_id` is sufficient. The in-memory store here is
//! for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Exposure-only state: readers report a run as stale past the
    /// threshold, but only the sweeper mutates it (to `Failed`).
    Stale,
}

impl RunState {
    pub fn is_live(self) -> bool {
        matches!(self, RunState::Pending | RunState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

/// Per-enricher execution stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnricherStat {
    pub tag: String,
    pub upstream_calls: u64,
    pub duration_ms: u64,
}

/// Statistics accumulated by the orchestrator and attached at termination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub fetched_records: u64,
    pub output_rows: u64,
    pub upstream_calls: u64,
    pub fetch_ms: u64,
    pub enrich_ms: u64,
    pub transform_ms: u64,
    pub wall_ms: u64,
    pub enrichers: Vec<EnricherStat>,
}

/// Persisted outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub config_id: String,
    pub trigger: RunTrigger,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub row_count: Option<u64>,
    pub error_message: Option<String>,
    /// Soft failures recorded during enrichment; non-empty on a succeeded
    /// run means partial data.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Destination snapshot taken at dispatch time.
    pub destination: String,
    #[serde(default)]
    pub stats: Option<RunStats>,
}

impl RunRecord {
    pub fn dispatched(
        run_id: &str,
        config_id: &str,
        trigger: RunTrigger,
        destination: &str,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            config_id: config_id.to_string(),
            trigger,
            state: RunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            row_count: None,
            error_message: None,
            errors: Vec::new(),
            destination: destination.to_string(),
            stats: None,
        }
    }

    /// Whether the run has been live longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.state.is_live() && now - self.started_at > threshold
    }
}

/// Outcome of the atomic dispatch check.
#[derive(Debug)]
pub enum BeginRun {
    /// The record was inserted as `pending`; the caller owns execution.
    Started,
    /// A record with this `run_id` already exists.
    Existing(RunRecord),
    /// Another run for the same configuration is live.
    Busy { running_run_id: String },
}

/// Persistence seam for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Atomically: return the existing record for `record.run_id` if any,
    /// else refuse when another run for the same config is live, else insert
    /// as `pending`.
    async fn begin(&self, record: RunRecord) -> Result<BeginRun, EngineError>;

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError>;

    /// Replace the stored record. Transitions are owned by the dispatcher
    /// and are one-way; stores do not re-order states.
    async fn put(&self, record: RunRecord) -> Result<(), EngineError>;

    /// When the configuration last succeeded, for the scheduler.
    async fn last_success(&self, config_id: &str)
        -> Result<Option<DateTime<Utc>>, EngineError>;

    /// Advance every run live longer than `threshold` to `failed` with a
    /// stuck-run message. Returns the affected records.
    async fn sweep_stuck(&self, threshold: Duration) -> Result<Vec<RunRecord>, EngineError>;
}

/// In-memory run store.
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<HashMap<String, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin(&self, record: RunRecord) -> Result<BeginRun, EngineError> {
        let mut map = self.inner.lock().expect("run store poisoned");
        if let Some(existing) = map.get(&record.run_id) {
            return Ok(BeginRun::Existing(existing.clone()));
        }
        if let Some(live) = map
            .values()
            .find(|r| r.config_id == record.config_id && r.state.is_live())
        {
            return Ok(BeginRun::Busy {
                running_run_id: live.run_id.clone(),
            });
        }
        map.insert(record.run_id.clone(), record);
        Ok(BeginRun::Started)
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        let map = self.inner.lock().expect("run store poisoned");
        Ok(map.get(run_id).cloned())
    }

    async fn put(&self, record: RunRecord) -> Result<(), EngineError> {
        let mut map = self.inner.lock().expect("run store poisoned");
        map.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn last_success(
        &self,
        config_id: &str,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let map = self.inner.lock().expect("run store poisoned");
        Ok(map
            .values()
            .filter(|r| r.config_id == config_id && r.state == RunState::Succeeded)
            .filter_map(|r| r.finished_at)
            .max())
    }

    async fn sweep_stuck(&self, threshold: Duration) -> Result<Vec<RunRecord>, EngineError> {
        let now = Utc::now();
        let mut map = self.inner.lock().expect("run store poisoned");
        let mut swept = Vec::new();
        for record in map.values_mut() {
            if record.is_stale(threshold, now) {
                record.state = RunState::Failed;
                record.finished_at = Some(now);
                record.error_message = Some(EngineError::StuckRun.to_string());
                swept.push(record.clone());
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(run_id: &str, config_id: &str) -> RunRecord {
        RunRecord::dispatched(run_id, config_id, RunTrigger::Manual, "sheet://x")
    }

    #[tokio::test]
    async fn begin_deduplicates_on_run_id() {
        let store = MemoryRunStore::new();
        assert!(matches!(
            store.begin(pending("r1", "c1")).await.unwrap(),
            BeginRun::Started
        ));
        match store.begin(pending("r1", "c1")).await.unwrap() {
            BeginRun::Existing(r) => assert_eq!(r.run_id, "r1"),
            other => panic!("expected Existing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn begin_refuses_second_live_run_per_config() {
        let store = MemoryRunStore::new();
        store.begin(pending("r1", "c1")).await.unwrap();
        match store.begin(pending("r2", "c1")).await.unwrap() {
            BeginRun::Busy { running_run_id } => assert_eq!(running_run_id, "r1"),
            other => panic!("expected Busy, got {other:?}"),
        }
        // a different configuration is unaffected
        assert!(matches!(
            store.begin(pending("r3", "c2")).await.unwrap(),
            BeginRun::Started
        ));
    }

    #[tokio::test]
    async fn sweep_fails_only_stale_runs() {
        let store = MemoryRunStore::new();
        let mut old = pending("r1", "c1");
        old.started_at = Utc::now() - Duration::minutes(30);
        old.state = RunState::Running;
        store.put(old).await.unwrap();
        store.begin(pending("r2", "c2")).await.unwrap();

        let swept = store.sweep_stuck(Duration::minutes(15)).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].run_id, "r1");
        assert_eq!(swept[0].state, RunState::Failed);
        assert_eq!(
            store.get("r2").await.unwrap().unwrap().state,
            RunState::Pending
        );
    }
}
