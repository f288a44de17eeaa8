//! HipCortex: content-addressed snapshots and verified rollback
//!
//! A snapshot binds the world state to the memory trace that produced
//! it: every state entry and memory pointer becomes a blake3 leaf, the
//! Merkle root over those leaves is the snapshot's content address, and
//! restore refuses to run if the recomputed root disagrees with the
//! stored one. Corruption cannot restore quietly.
//!
//! Key Concepts:
//! - [`ContentHash`]: blake3 digest, the unit of content addressing
//! - [`CombinedSnapshot`]: world state + memory pointers + Merkle root
//! - [`HipCortex`]: takes snapshots, verifies them against CRV gate
//!   results, and performs policy-gated rollback
//!
//! Design Principles:
//! - Integrity before anything: the Merkle check runs first and a
//!   mismatch aborts with zero state change.
//! - Rollback is an action like any other: unverified or critical
//!   snapshots route through the Goal-Guard.
//! - Restore is atomic: the store swallows the whole snapshot under a
//!   single lock, so no failure leaves a half-restored world.

#![deny(unsafe_code)]

pub mod cortex;
pub mod errors;
pub mod hash;
pub mod snapshot;

pub use cortex::{CortexConfig, HipCortex};
pub use errors::{CortexError, CortexResult};
pub use hash::{merkle_root, ContentHash, InvalidHash};
pub use snapshot::{CombinedSnapshot, MemoryPointer, RollbackReport};
