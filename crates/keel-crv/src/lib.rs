//! Commit validation (CRV)
//!
//! Every state mutation a task stages is expressed as a diff set and
//! submitted here before it may commit. A [`Gate`] runs an ordered list
//! of [`Validator`]s over the diffs; a gate configured with
//! `block_on_failure` refuses the commit when any validator fails.
//!
//! Validators are pure functions of the diff set. They stage nothing,
//! mutate nothing, and can be added without touching gate internals.
//! Outcomes come back as data ([`GateResult`], never panics or thrown
//! errors), so callers branch on fields, not on control flow.

#![deny(unsafe_code)]

mod gate;
mod validation;
mod validator;

pub use gate::*;
pub use validation::*;
pub use validator::*;
