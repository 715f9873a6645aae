use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertisError {
    #[error("{0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unable to generate unique identifier for {prefix} after {attempts} attempts, try again")]
    IdentifierExhausted { prefix: String, attempts: u32 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CertisError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        CertisError::NotFound(format!("{entity} not found: {id}"))
    }

    pub fn code(&self) -> &'static str {
        match self {
            CertisError::NotFound(_) => "not_found",
            CertisError::InvalidInput(_) => "invalid_input",
            CertisError::Duplicate(_) => "duplicate",
            CertisError::Unauthorized(_) => "unauthorized",
            CertisError::Forbidden(_) => "forbidden",
            CertisError::IdentifierExhausted { .. } => "identifier_exhausted",
            CertisError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&CertisError> for ErrorResponse {
    fn from(err: &CertisError) -> Self {
        ErrorResponse {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_asks_caller_to_retry() {
        let err = CertisError::IdentifierExhausted {
            prefix: "SHSL/25B/DM".into(),
            attempts: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("unable to generate unique identifier"));
        assert!(msg.contains("SHSL/25B/DM"));
        assert_eq!(err.code(), "identifier_exhausted");
    }

    #[test]
    fn error_response_carries_code() {
        let err = CertisError::not_found("certificate", 42);
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.error, "certificate not found: 42");
        assert_eq!(resp.code.as_deref(), Some("not_found"));
    }
}
