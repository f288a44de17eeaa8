//! Versioned state store and append-only event log
//!
//! Two pieces of plumbing everything else leans on:
//!
//! - **StateStore**: a key/value store where every write carries the
//!   version the writer last saw. A mismatch is a [`StateError::Conflict`],
//!   never a silent overwrite. Old versions stay readable, so a snapshot
//!   can be restored verbatim during rollback.
//! - **EventLog**: the audit stream. `append` returns only once the
//!   record is durable in its sink, which is what lets a run be replayed
//!   or resumed from the log.
//!
//! Both ship an in-memory implementation for tests and embedding, plus a
//! JSONL-backed log laid out as `<root>/<workflowId>/events.log`.

#![deny(unsafe_code)]

mod errors;
mod log;
mod store;

pub use errors::*;
pub use log::*;
pub use store::*;
