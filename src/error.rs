use thiserror::Error;

/// Main error type.
#[derive(Debug, Error)]
pub enum Error {
    /// malformed caller input: empty trees, broken linkage, bad indices
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// operation on a default-constructed policy
    #[error("policy is not initialized")]
    NotInitialized,
    /// no state in the policy matches the observed configuration
    #[error("observed configuration is not covered by the policy")]
    NotCovered,
    /// the queried state has no remaining path to the goal sink
    #[error("policy no longer has a solution")]
    NoSolution,
    /// a broken internal invariant: graph linkage, out-of-range probability
    #[error("internal error: {0}")]
    Internal(String),
    /// a serialized buffer that cannot be decoded
    #[error("malformed buffer: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
