//! Error type shared by the collaborator contracts

/// Error returned by a registry, config store or protocol collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote rejected request: code={code}, message={message}")]
    Rejected { code: i32, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote call timed out")]
    Timeout,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
