use thiserror::Error;

/// Describes the various errors that can be surfaced by the client
#[derive(Error, Debug)]
pub enum OsmoError {
    /// Input or validation failure caused by the user. Carries the HTTP status code when the
    /// failure came back from the service
    #[error("{message}")]
    User {
        message: String,
        status_code: Option<u16>,
    },

    /// Authentication or authorization failure on the submission path
    #[error("{message}")]
    Credential {
        message: String,
        workflow_id: Option<String>,
        status_code: Option<u16>,
    },

    /// A submission problem declared by the service with a structured error code
    #[error("{message}")]
    Submission {
        message: String,
        workflow_id: Option<String>,
        status_code: Option<u16>,
    },

    /// HTTP 5xx or a transport failure after retries. The message includes the status code,
    /// headers, and body as returned by the service
    #[error("{message}")]
    Server {
        message: String,
        status_code: Option<u16>,
    },

    /// 404 on a GET by identifier
    #[error("Requested resource was not found")]
    NotFound,

    /// IO errors from interacting with the file system
    #[error("Error while performing IO operation")]
    Io(#[from] std::io::Error),

    /// Invalid URL given, contains the underlying parsing error
    #[error("Invalid URL given")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Failed serializing JSON")]
    JsonSerializationError(#[from] serde_json::Error),

    #[error("Invalid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),

    /// A catch-all for uncategorized errors. Contains an error message describing the
    /// underlying issue
    #[error("{0}")]
    Other(String),
}

impl OsmoError {
    /// A plain user error with no HTTP status attached.
    pub fn user(message: impl Into<String>) -> Self {
        OsmoError::User {
            message: message.into(),
            status_code: None,
        }
    }

    /// A server-side error with no HTTP status attached (transport failures and the like).
    pub fn server(message: impl Into<String>) -> Self {
        OsmoError::Server {
            message: message.into(),
            status_code: None,
        }
    }

    /// The HTTP status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OsmoError::User { status_code, .. }
            | OsmoError::Credential { status_code, .. }
            | OsmoError::Submission { status_code, .. }
            | OsmoError::Server { status_code, .. } => *status_code,
            OsmoError::NotFound => Some(404),
            _ => None,
        }
    }

    /// The workflow id attached to a submission-path error, if any.
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            OsmoError::Credential { workflow_id, .. }
            | OsmoError::Submission { workflow_id, .. } => workflow_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the error is worth retrying with backoff. This is the set of status codes the
    /// rsync port-forward loop reconnects on; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status_code(),
            Some(408) | Some(425) | Some(429) | Some(500) | Some(502) | Some(503) | Some(504)
        )
    }
}

impl From<reqwest::Error> for OsmoError {
    fn from(e: reqwest::Error) -> Self {
        OsmoError::Server {
            message: format!("Transport error: {}", e),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for OsmoError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        OsmoError::server(format!("WebSocket error: {}", e))
    }
}

impl From<notify::Error> for OsmoError {
    fn from(e: notify::Error) -> Self {
        OsmoError::Other(format!("Filesystem watcher error: {}", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        for code in [408, 425, 429, 500, 502, 503, 504] {
            let err = OsmoError::Server {
                message: "boom".into(),
                status_code: Some(code),
            };
            assert!(err.is_retryable(), "{} should be retryable", code);
        }
        for code in [400, 401, 403, 409, 501] {
            let err = OsmoError::User {
                message: "boom".into(),
                status_code: Some(code),
            };
            assert!(!err.is_retryable(), "{} should be fatal", code);
        }
        assert!(!OsmoError::user("no status").is_retryable());
        assert!(!OsmoError::NotFound.is_retryable());
    }

    #[test]
    fn test_workflow_id_only_on_submission_path() {
        let err = OsmoError::Submission {
            message: "rejected".into(),
            workflow_id: Some("wf-1".into()),
            status_code: Some(400),
        };
        assert_eq!(err.workflow_id(), Some("wf-1"));
        assert_eq!(err.status_code(), Some(400));

        let err = OsmoError::Server {
            message: "down".into(),
            status_code: Some(503),
        };
        assert_eq!(err.workflow_id(), None);
    }
}
