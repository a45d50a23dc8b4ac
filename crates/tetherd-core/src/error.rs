//! Gateway errors and their wire codes

use serde::{Deserialize, Serialize};

/// Structured error code returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgs,
    HealthRecovering,
    HealthDown,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "INVALID_ARGS",
            ErrorCode::HealthRecovering => "HEALTH_RECOVERING",
            ErrorCode::HealthDown => "HEALTH_DOWN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Agent is recovering")]
    HealthRecovering,

    #[error("Agent is down")]
    HealthDown,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidArgs(_) => ErrorCode::InvalidArgs,
            GatewayError::HealthRecovering => ErrorCode::HealthRecovering,
            GatewayError::HealthDown => ErrorCode::HealthDown,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::Session(_)
            | GatewayError::Db(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => ErrorCode::InternalError,
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            GatewayError::InvalidArgs("x".into()).code(),
            ErrorCode::InvalidArgs
        );
        assert_eq!(GatewayError::HealthDown.code().as_str(), "HEALTH_DOWN");
        let io = GatewayError::from(std::io::Error::other("disk"));
        assert_eq!(io.code(), ErrorCode::InternalError);
        assert_eq!(
            serde_json::to_string(&ErrorCode::HealthRecovering).unwrap(),
            "\"HEALTH_RECOVERING\""
        );
    }
}
