//! Planning module for reconciliation runs.
//!
//! This module compares the desired and live graphs, turns the differences
//! into an ordered plan, and executes that plan with retries and bounded
//! concurrency.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff, compare};
pub use executor::{ActionResult, ExecutionResult, NodeOutcome, PlanExecutor};
pub use plan::{ActionType, DeploymentPlan, PlanMode, PlannedAction};
pub use retry::{RetryError, RetryPolicy};
