//! Workflow orchestration for Keel
//!
//! The engine ties the kernel together: it takes a validated
//! [`keel_types::WorkflowSpec`], schedules its tasks in dependency
//! order, and runs every attempt through the full governance path
//! before anything commits.
//!
//! Key Concepts:
//! - [`Orchestrator`]: drives a workflow to a terminal status, resuming
//!   from persisted run state when asked again
//! - [`TaskExecutor`]: the trait a task runtime implements; executors
//!   stage writes into a [`TaskContext`] and never touch the store
//! - [`TaskContext`]: read-through store view with a buffered write set
//! - [`EngineConfig`]: parallelism, timeouts and snapshot policy
//!
//! Design Principles:
//! 1. Nothing commits unreviewed. Every staged diff passes the CRV gate
//!    chain, and HIGH/CRITICAL tiers park for the Goal-Guard.
//! 2. Progress is durable. Run state is persisted after every task
//!    transition under a reserved key, so a crashed run resumes instead
//!    of re-running committed work.
//! 3. Failure is data. Task failures land in the report and the event
//!    log; `Err` from the engine means the run itself could not proceed.

#![deny(unsafe_code)]

mod config;
mod context;
mod errors;
mod executor;
mod orchestrator;

pub use config::EngineConfig;
pub use context::{RunContext, StagedWrite, TaskContext};
pub use errors::{EngineError, EngineResult, ExecError};
pub use executor::{BuiltinExecutor, TaskExecutor};
pub use orchestrator::{Orchestrator, WorkflowReport};
