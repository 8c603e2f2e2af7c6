use thiserror::Error;

/// Error kinds surfaced to callers of the session services.
///
/// Callers receive one of these variants, never raw runtime output; the
/// offending command and its stderr are logged at the failure site instead.
#[derive(Debug, Error)]
pub enum IdeError {
    #[error("{0:?} is not a valid container name")]
    InvalidName(String),

    /// Runtime output did not match the contractual shape. This indicates a
    /// broken runtime contract, not bad user input.
    #[error("unexpected runtime output: {0}")]
    ParseFailure(String),

    #[error("container is not found")]
    NotFound,

    /// A heartbeat arrived for a session that was never opened or has
    /// already been swept.
    #[error("no active session")]
    NoActiveSession,

    #[error("requester does not own the lab's course")]
    Forbidden,

    #[error("operation canceled by caller")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IdeError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        IdeError::Internal(err.to_string())
    }
}
