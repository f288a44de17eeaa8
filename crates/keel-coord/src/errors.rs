//! Coordinator errors

use keel_types::{AgentId, ResourceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),

    #[error("agent {agent} holds no lock on {resource}")]
    NotHolder { resource: ResourceId, agent: AgentId },

    #[error("agent {agent} timed out waiting for {resource}")]
    AcquireTimeout { resource: ResourceId, agent: AgentId },

    #[error("coordinator channel closed while waiting for a grant")]
    Closed,
}

pub type CoordResult<T> = Result<T, CoordError>;
