//! Scheduler tick and stuck-run sweeper.
//!
//! The scheduling substrate (cron, queue, leader election) is external; the
//! engine only needs `run_export` called with unique run ids. The tick here
//! inspects every active configuration with a non-zero interval and
//! dispatches the ones whose last success is older than that interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rex_core::{EngineError, RunStore, RunTrigger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Dispatcher, RunRequest};

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, tick: Duration) -> Self {
        Self { dispatcher, tick }
    }

    /// Periodic loop; lives until the token fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick_once().await {
                Ok(dispatched) if dispatched > 0 => {
                    info!(dispatched, "scheduler tick dispatched runs");
                }
                Ok(_) => debug!("scheduler tick, nothing due"),
                Err(e) => warn!(error = %e, "scheduler tick failed"),
            }
        }
    }

    /// One inspection pass. Returns how many runs were dispatched.
    pub async fn tick_once(&self) -> Result<usize, EngineError> {
        let mut dispatched = 0;
        for config in self.dispatcher.configs().active().await? {
            if config.schedule_minutes == 0 {
                continue;
            }
            let due = match self.dispatcher.runs().last_success(&config.id).await? {
                Some(at) => {
                    Utc::now() - at >= chrono::Duration::minutes(config.schedule_minutes.into())
                }
                None => true,
            };
            if !due {
                continue;
            }

            let request = RunRequest {
                run_id: Uuid::new_v4().to_string(),
                trigger: RunTrigger::Scheduled,
            };
            match self.dispatcher.run_export(&config.id, request).await {
                Ok(status) if status.in_progress => {
                    debug!(config = %config.id, "already running, not enqueued")
                }
                Ok(_) => dispatched += 1,
                Err(e) => warn!(config = %config.id, error = %e, "scheduled run failed"),
            }
        }
        Ok(dispatched)
    }
}

/// Advance runs stuck in a live state past `threshold` to `failed`.
pub async fn sweep_stuck_runs(
    runs: &dyn RunStore,
    threshold: chrono::Duration,
) -> Result<usize, EngineError> {
    let swept = runs.sweep_stuck(threshold).await?;
    for run in &swept {
        warn!(run_id = %run.run_id, config = %run.config_id, "stuck run failed by sweeper");
    }
    Ok(swept.len())
}

/// Periodic sweeper loop; lives until the token fires.
pub async fn run_sweeper(
    runs: Arc<dyn RunStore>,
    threshold: chrono::Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = sweep_stuck_runs(runs.as_ref(), threshold).await {
            warn!(error = %e, "sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, orders_export};
    use rex_core::RunState;
    use serde_json::json;

    fn one_order_page() -> serde_json::Value {
        json!({"status": "SUCCESS", "orders": [
            {"order_id": 101, "date_add": 1705312800, "email": "a@x"},
        ]})
    }

    #[tokio::test]
    async fn tick_dispatches_due_configs_once() {
        let mut scheduled = orders_export("exp-sched");
        scheduled.schedule_minutes = 30;
        let streaming = orders_export("exp-manual"); // schedule 0: never ticked
        let h = harness(vec![scheduled, streaming]);
        h.api.push("getOrders", one_order_page());

        let scheduler = Scheduler::new(h.dispatcher.clone(), Duration::from_secs(60));
        assert_eq!(scheduler.tick_once().await.unwrap(), 1);
        assert_eq!(h.api.call_count("getOrders"), 1);

        // the success just recorded keeps the config quiet until the
        // interval elapses
        assert_eq!(scheduler.tick_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scheduled_runs_carry_fresh_uuids_and_the_scheduled_trigger() {
        let mut scheduled = orders_export("exp-sched");
        scheduled.schedule_minutes = 5;
        let h = harness(vec![scheduled]);
        h.api.push("getOrders", one_order_page());

        let scheduler = Scheduler::new(h.dispatcher.clone(), Duration::from_secs(60));
        scheduler.tick_once().await.unwrap();

        let last = h.runs.last_success("exp-sched").await.unwrap();
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn sweeper_reports_how_many_runs_it_failed() {
        let h = harness(vec![]);
        let mut stuck = rex_core::RunRecord::dispatched(
            "R-stuck",
            "exp-1",
            rex_core::RunTrigger::Manual,
            "sheet://x",
        );
        stuck.state = RunState::Running;
        stuck.started_at = Utc::now() - chrono::Duration::minutes(60);
        h.runs.put(stuck).await.unwrap();

        let swept = sweep_stuck_runs(h.runs.as_ref(), chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let record = h.runs.get("R-stuck").await.unwrap().unwrap();
        assert_eq!(record.state, RunState::Failed);
    }
}
