//! Domain types for Keel
//!
//! Keel workflows are NOT ad-hoc scripts. They are **dependency DAGs of
//! governed tasks**: every task declares its risk tier, its retry budget,
//! the resources it locks, and the compensation that runs if it fails.
//!
//! # Key Concepts
//!
//! - **WorkflowSpec**: A validated DAG of tasks. Dependencies are declared
//!   explicitly; cycles are rejected at load time, never at run time.
//! - **TaskSpec**: One unit of work — type, risk tier, timeout, retry
//!   policy, compensation hooks, resource claims, idempotency key.
//! - **StateEntry / StateSnapshot / StateDiff**: The versioned world-state
//!   model. Every mutation is expressed as a diff between snapshots so it
//!   can be validated before it is committed.
//! - **RiskTier**: LOW through CRITICAL. The tier decides whether a task
//!   commits autonomously or parks for human approval.
//! - **Event**: One append-only audit record. Events are the ground truth
//!   for what the kernel did and why.
//!
//! # Design Principles
//!
//! 1. Specs are immutable once validated. To change a workflow, submit a
//!    new version.
//! 2. Every mutation is a diff. No task writes state that was never
//!    expressed as a reviewable change.
//! 3. Ordering is deterministic: topological order ties are broken by
//!    task id, so two runs of the same spec schedule identically.
//! 4. Failure handling is explicit — retry budgets and compensation hooks
//!    live in the spec, never in executor code.

#![deny(unsafe_code)]

mod errors;
mod event;
mod ids;
mod principal;
mod risk;
mod state;
mod task;
mod workflow;
mod workflow_state;

pub use errors::*;
pub use event::*;
pub use ids::*;
pub use principal::*;
pub use risk::*;
pub use state::*;
pub use task::*;
pub use workflow::*;
pub use workflow_state::*;
