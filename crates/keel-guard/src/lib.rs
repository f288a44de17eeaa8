//! Goal-Guard: the policy state machine
//!
//! Every governed action runs through the same five-state machine:
//! idle → evaluating → {approved, rejected, pending_human}, with
//! pending_human resolving to approved or rejected. There is no path
//! around it; even the kernel's own rollback asks the guard first.
//!
//! The tier decides the route. LOW and MEDIUM actions approve
//! autonomously once the principal's permissions check out. HIGH parks
//! in `pending_human` until one human resolves it. CRITICAL requires
//! two distinct humans. Approvals expire; an expired approval is a
//! rejection, never a default-allow.
//!
//! Every transition — approvals, denials, expiries — lands in the
//! audit trail with who asked, what for, and why it ended how it did.

#![deny(unsafe_code)]

mod approval;
mod audit;
mod decision;
mod errors;
mod guard;

pub use approval::*;
pub use audit::*;
pub use decision::*;
pub use errors::*;
pub use guard::*;
