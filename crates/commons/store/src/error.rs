use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
///
/// The storage layer is the final arbiter of the ledger's constraints;
/// callers' pre-checks are an optimization, not a substitute. Every compound
/// operation either applies fully or returns one of these with no state
/// change observable.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient balance: required {required_micro}, available {available_micro}")]
    InsufficientBalance {
        required_micro: i64,
        available_micro: i64,
    },

    #[error("conservation violation: {0}")]
    ConservationViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("four-eyes violation: {0}")]
    FourEyes(String),

    #[error("agent {agent_id} already voted on proposal {proposal_id}")]
    AlreadyVoted {
        proposal_id: String,
        agent_id: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}
