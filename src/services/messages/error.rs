use thiserror::Error;

use crate::state_machine::requests::{ErrorCategory, RequestError};

/// Error type for the message handling services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("the message is {size} bytes long but at most {limit} bytes are accepted")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("failed to parse the message: {0}")]
    Parsing(#[from] serde_json::Error),

    #[error("the first message of a connection must be a registration")]
    NotRegistered,

    #[error("the state machine failed to process the request: {0}")]
    StateMachine(#[from] RequestError),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// A stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            Self::Parsing(_) => "MALFORMED_MESSAGE",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::StateMachine(err) => err.code(),
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StateMachine(err) => err.category(),
            Self::InternalError(_) => ErrorCategory::Internal,
            _ => ErrorCategory::Protocol,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StateMachine(err) => err.is_retryable(),
            Self::InternalError(_) => true,
            _ => false,
        }
    }
}

impl From<Box<dyn std::error::Error + Sync + Send>> for ServiceError {
    fn from(e: Box<dyn std::error::Error + Sync + Send>) -> Self {
        match e.downcast::<ServiceError>() {
            Ok(e) => *e,
            Err(e) => ServiceError::InternalError(format!("{}", e)),
        }
    }
}
