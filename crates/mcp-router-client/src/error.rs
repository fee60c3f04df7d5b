//! Client error types

use mcp_router_api::RemoteError;

/// Error type for registry and config store clients
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("server returned error: code={code}, message={message}")]
    ServerError { code: i32, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("no server address configured")]
    NoServer,

    #[error("request timeout")]
    Timeout,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::ServerError { code: 404, .. })
    }
}

impl From<ClientError> for RemoteError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Http(e) if e.is_timeout() => RemoteError::Timeout,
            ClientError::Http(e) => RemoteError::Unavailable(e.to_string()),
            ClientError::NoServer => RemoteError::Unavailable("no server address configured".into()),
            ClientError::Timeout => RemoteError::Timeout,
            ClientError::ServerError { code: 404, message } => RemoteError::NotFound(message),
            ClientError::ServerError { code, message } => RemoteError::Rejected { code, message },
            ClientError::AuthFailed(reason) => RemoteError::Rejected {
                code: 403,
                message: reason,
            },
            ClientError::InvalidResponse(reason) => RemoteError::Other(anyhow::anyhow!(reason)),
            ClientError::Other(e) => RemoteError::Other(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::NoServer;
        assert_eq!(err.to_string(), "no server address configured");

        let err = ClientError::AuthFailed("bad credentials".to_string());
        assert_eq!(err.to_string(), "auth failed: bad credentials");

        let err = ClientError::ServerError {
            code: 500,
            message: "internal error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server returned error: code=500, message=internal error"
        );
    }

    #[test]
    fn test_into_remote_error() {
        let err: RemoteError = ClientError::ServerError {
            code: 404,
            message: "config data not exist".to_string(),
        }
        .into();
        assert!(matches!(err, RemoteError::NotFound(_)));

        let err: RemoteError = ClientError::ServerError {
            code: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, RemoteError::Rejected { code: 500, .. }));

        let err: RemoteError = ClientError::Timeout.into();
        assert!(matches!(err, RemoteError::Timeout));
    }

    #[test]
    fn test_is_not_found() {
        assert!(
            ClientError::ServerError {
                code: 404,
                message: String::new()
            }
            .is_not_found()
        );
        assert!(!ClientError::Timeout.is_not_found());
    }
}
