use thiserror::Error;

use commons_store::StorageError;

/// Governance errors, shared by the revenue-rule and agent surfaces.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("revenue split must sum to 10000 bps, got {total_bps}")]
    UnbalancedSplit { total_bps: u64 },

    #[error("four-eyes violation: {0}")]
    FourEyesViolation(String),

    #[error("parameter {0} is not proposable by agents")]
    NotProposableByAgents(String),

    #[error("agent {agent_id} already voted on proposal {proposal_id}")]
    AlreadyVoted {
        proposal_id: String,
        agent_id: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for GovernanceError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::FourEyes(msg) => Self::FourEyesViolation(msg),
            StorageError::AlreadyVoted {
                proposal_id,
                agent_id,
            } => Self::AlreadyVoted {
                proposal_id,
                agent_id,
            },
            StorageError::InvalidState(msg) => Self::InvalidState(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}
