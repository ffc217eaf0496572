//! # REX Engine - Orchestrator, Dispatcher, Scheduler
//!
//! The runtime around the export pipeline: the three-phase orchestrator
//! (FETCH → ENRICH → TRANSFORM), the idempotent run dispatcher with its
//! per-configuration exclusivity and wall-clock guard, and the scheduler
//! tick plus stuck-run sweeper.
//!
//! ## Run lifecycle
//!
//! A caller (HTTP surface or scheduler) invokes
//! [`Dispatcher::run_export`] with a unique 128-bit run id. The dispatcher
//! deduplicates on that id, refuses a second live run for the same
//! configuration, executes the pipeline under a timeout, hands the finished
//! table to the sheet writer, and persists the outcome in the run store.

pub mod dispatch;
pub mod pipeline;
pub mod schedule;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatch::{
    ApiFactory, DispatchOptions, Dispatcher, HttpApiFactory, RunRequest, RunStatus,
};
pub use pipeline::{Pipeline, PipelineFailure, PipelineOutput};
pub use schedule::{run_sweeper, sweep_stuck_runs, Scheduler};
