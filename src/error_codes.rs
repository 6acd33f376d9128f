//! Structured rejection codes returned by a lobby service.
//!
//! Service adapters map the remote service's own error vocabulary onto these
//! codes so that callers can react to the common failure modes (room gone,
//! room full, wrong password) without parsing messages. They serialize using
//! `SCREAMING_SNAKE_CASE`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes carried by [`LobbyError::Service`](crate::LobbyError::Service).
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    Unauthorized,
    AuthenticationRequired,

    // Validation errors
    InvalidInput,
    InvalidRoomCode,

    // Room errors
    RoomNotFound,
    RoomFull,
    RoomLocked,
    IncorrectPassword,
    AlreadyInRoom,
    NotInRoom,
    Forbidden,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            // Authentication errors
            Self::Unauthorized => {
                "Access denied. Authentication credentials are missing or invalid."
            }
            Self::AuthenticationRequired => {
                "This operation requires authentication. Sign in before using the lobby service."
            }

            // Validation errors
            Self::InvalidInput => {
                "The provided input is invalid or malformed. Check your request parameters."
            }
            Self::InvalidRoomCode => {
                "The room code is invalid or malformed. Room codes must follow the required format."
            }

            // Room errors
            Self::RoomNotFound => {
                "The requested room could not be found. It may have been deleted or the code is incorrect."
            }
            Self::RoomFull => {
                "The room has reached its maximum player capacity. Try joining a different room."
            }
            Self::RoomLocked => "The room is locked and does not accept new participants.",
            Self::IncorrectPassword => {
                "The password is missing or incorrect for this room."
            }
            Self::AlreadyInRoom => {
                "You are already a member of this room."
            }
            Self::NotInRoom => {
                "You are not a member of this room. Join the room before performing this action."
            }
            Self::Forbidden => {
                "You do not have permission to perform this action. Only the host may update the room, and participants may only update their own data."
            }

            // Rate limiting
            Self::RateLimitExceeded => {
                "Too many requests in a short time. Please slow down and try again later."
            }

            // Server errors
            Self::InternalError => {
                "An internal service error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
        }
    }

    /// Returns `true` for codes that mean the caller is no longer in the room.
    pub fn means_departed(&self) -> bool {
        matches!(self, Self::RoomNotFound | Self::NotInRoom)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
