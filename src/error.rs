use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{service} returned HTTP {status}: {body}")]
    HttpStatus {
        service: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Parse(e.to_string())
    }
}

impl AppError {
    /// Whether the queue should re-deliver a job that failed with this error.
    /// 4xx responses other than 429 indicate misconfiguration and will not
    /// heal on retry; missing entities and broken invariants likewise.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Transport(_) | AppError::Subprocess(_) | AppError::Io(_) => true,
            AppError::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            AppError::Parse(_) => true,
            AppError::Database(_) | AppError::Redis(_) => true,
            AppError::NotFound(_)
            | AppError::InvariantViolation(_)
            | AppError::Busy(_)
            | AppError::Unavailable(_) => false,
            AppError::Internal(_) => false,
        }
    }

    /// Per-kind cap on re-deliveries, tighter than the job's attempt
    /// budget. Parse failures get exactly one retry: a second identical
    /// failure means the payload shape is wrong, not that the call was
    /// flaky. None defers to the job's own attempt budget.
    pub fn retry_limit(&self) -> Option<u32> {
        match self {
            AppError::Parse(_) => Some(1),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_status_class() {
        let rate_limited = AppError::HttpStatus {
            service: "llm",
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(rate_limited.is_retryable());

        let bad_key = AppError::HttpStatus {
            service: "llm",
            status: StatusCode::UNAUTHORIZED,
            body: "invalid api key".to_string(),
        };
        assert!(!bad_key.is_retryable());

        let upstream = AppError::HttpStatus {
            service: "stt",
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(upstream.is_retryable());
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!AppError::NotFound("episode".into()).is_retryable());
        assert!(!AppError::Busy("transcription in flight".into()).is_retryable());
        assert!(!AppError::Unavailable("queue not configured".into()).is_retryable());
    }

    #[test]
    fn parse_errors_are_capped_at_one_retry() {
        assert_eq!(AppError::Parse("bad json".into()).retry_limit(), Some(1));
        assert_eq!(AppError::Transport("reset".into()).retry_limit(), None);
        assert_eq!(AppError::NotFound("episode".into()).retry_limit(), None);
    }
}
