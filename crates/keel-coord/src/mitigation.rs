//! Mitigation strategies and outcomes

use keel_types::{AgentId, ResourceId};
use serde::{Deserialize, Serialize};

/// What to do about a detected deadlock or livelock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStrategy {
    /// Pick a victim, release everything it holds, and tell the engine
    /// to fail its workflow
    Abort,
    /// Release just enough for the others to proceed; the displaced
    /// agent may try again
    Replan,
    /// Touch nothing; raise a structured incident for an operator
    Escalate,
}

impl std::fmt::Display for MitigationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MitigationStrategy::Abort => write!(f, "abort"),
            MitigationStrategy::Replan => write!(f, "replan"),
            MitigationStrategy::Escalate => write!(f, "escalate"),
        }
    }
}

/// What a mitigation actually did.
#[derive(Clone, Debug, Serialize)]
pub struct MitigationOutcome {
    pub strategy: MitigationStrategy,
    /// Agents the strategy acted on; for Abort the engine fails their
    /// workflows
    pub victims: Vec<AgentId>,
    pub released: Vec<ResourceId>,
    /// Operator-facing incident text, Escalate only
    pub incident: Option<String>,
}

impl MitigationOutcome {
    pub fn released_anything(&self) -> bool {
        !self.released.is_empty()
    }
}
