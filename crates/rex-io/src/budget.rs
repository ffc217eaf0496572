//! Token-scoped rate budget.
//!
//! The upstream API allows a bounded number of calls per rolling window per
//! token. One [`RateBudget`] is shared by every caller holding the same
//! token: all concurrent enrichers of one run and all concurrent runs of the
//! same tenant. Admission is the only permitted form of intra-client
//! waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rex_core::EngineError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sliding-window admission controller: at most `max` acquisitions per
/// rolling `window`.
pub struct RateBudget {
    max: usize,
    window: Duration,
    slots: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            slots: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Block until a slot is available or the caller cancels.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        loop {
            let wait_until = {
                let mut slots = self.slots.lock().expect("budget poisoned");
                let now = Instant::now();
                while slots.front().is_some_and(|t| now - *t >= self.window) {
                    slots.pop_front();
                }
                if slots.len() < self.max {
                    slots.push_back(now);
                    return Ok(());
                }
                // oldest slot expires first; racing waiters re-check in the loop
                *slots.front().expect("window full") + self.window
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
    }
}

/// Process-wide registry handing out one shared budget per token.
#[derive(Clone)]
pub struct BudgetRegistry {
    max: usize,
    window: Duration,
    buckets: Arc<DashMap<String, Arc<RateBudget>>>,
}

impl BudgetRegistry {
    /// Operational default: 100 calls per rolling 60 s.
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn for_token(&self, token: &str) -> Arc<RateBudget> {
        self.buckets
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(RateBudget::new(self.max, self.window)))
            .clone()
    }
}

impl Default for BudgetRegistry {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
