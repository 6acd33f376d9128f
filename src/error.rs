//! Error types for the lobby synchronization engine.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur when talking to the lobby service or driving a session.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// A governed call was attempted while another call on the same governor
    /// was still in flight. Carries the governor's name.
    #[error("request already running: {0}")]
    AlreadyRunning(&'static str),

    /// The lobby service rejected the request (room gone, full, wrong password, ...).
    #[error("service error: {message}")]
    Service {
        /// Human-readable error message from the service.
        message: String,
        /// Structured error code, if provided by the service.
        error_code: Option<ErrorCode>,
    },

    /// The call to the lobby service failed abnormally.
    #[error("transport error: {0}")]
    Transport(String),

    /// The lobby service could not be initialized.
    #[error("lobby service not initialized")]
    NotInitialized,

    /// The identity provider did not produce a participant id.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Failed to serialize or deserialize a model value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LobbyError {
    /// Builds a [`LobbyError::Service`] from a code, using the code's description as message.
    pub fn rejected(error_code: ErrorCode) -> Self {
        Self::Service {
            message: error_code.description().to_string(),
            error_code: Some(error_code),
        }
    }

    /// Returns `true` for failures the caller is expected to handle as an
    /// empty result: remote rejections and governor concurrency rejections.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Service { .. } | Self::AlreadyRunning(_))
    }

    /// Returns the structured error code, if this is a coded service rejection.
    pub fn error_code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Service { error_code, .. } => error_code.as_ref(),
            _ => None,
        }
    }
}

/// A specialized [`Result`] type for lobby operations.
pub type Result<T> = std::result::Result<T, LobbyError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn rejected_uses_code_description() {
        let err = LobbyError::rejected(ErrorCode::RoomFull);
        assert_eq!(err.error_code(), Some(&ErrorCode::RoomFull));
        assert!(err.to_string().contains(ErrorCode::RoomFull.description()));
    }

    #[test]
    fn rejection_classification() {
        assert!(LobbyError::rejected(ErrorCode::RoomNotFound).is_rejection());
        assert!(LobbyError::AlreadyRunning("query").is_rejection());
        assert!(!LobbyError::Transport("reset".into()).is_rejection());
        assert!(!LobbyError::NotAuthenticated.is_rejection());
        assert!(LobbyError::Transport("reset".into()).error_code().is_none());
    }
}
