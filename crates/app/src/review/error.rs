use thiserror::Error;

/// Failure taxonomy surfaced to command callers. Nothing here is fatal to the
/// process; the worst case is a rejected `start-session`.
#[derive(Debug, Error)]
pub(crate) enum ReviewError {
    #[error("no session for room {0:?}")]
    SessionNotFound(String),
    #[error("room {0:?} already has a session")]
    AlreadyExists(String),
    #[error("unsupported video format {0:?}")]
    InvalidFormat(String),
    #[error("failed to start playback: {0}")]
    Startup(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
