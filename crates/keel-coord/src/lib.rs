//! Multi-agent resource coordination for Keel
//!
//! Agents competing for the same resources are the normal case, not the
//! exception. The coordinator owns a lock table over named resources,
//! grants shared or exclusive holds under a per-resource policy, and
//! watches the table for the two pathologies of contention:
//!
//! - **Deadlock**: a cycle in the wait-for graph. Detected by DFS over
//!   explicit agent-to-agent edges, on demand and from the background
//!   sweep.
//! - **Livelock**: agents cycling through the same short state pattern
//!   without signalling progress. Detected from bounded per-agent
//!   transition histories.
//!
//! Key Concepts:
//! - [`Coordinator`]: the lock table plus detectors and the sweep task
//! - [`CoordinationPolicy`]: per-resource grant ordering
//! - [`DeadlockReport`] / [`LivelockReport`]: detection output, derived
//!   from live state and never persisted
//! - [`MitigationStrategy`]: Abort, Replan or Escalate, applied to a
//!   report and summarized in a [`MitigationOutcome`]
//!
//! Design Principles:
//! - Holds expire. A lock carries the timeout it was acquired under and
//!   the sweep enforces it; a crashed agent cannot pin a resource.
//! - Waiters never spin. A parked acquire awaits a oneshot grant under
//!   its own deadline and times out to `Ok(false)`.
//! - Every lock transition is observable through the event channel.

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod deadlock;
pub mod errors;
pub mod livelock;
pub mod lock;
pub mod mitigation;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordEvent, CoordEventKind, Coordinator};
pub use deadlock::DeadlockReport;
pub use errors::{CoordError, CoordResult};
pub use livelock::LivelockReport;
pub use lock::{CoordinationPolicy, Lock};
pub use mitigation::{MitigationOutcome, MitigationStrategy};
