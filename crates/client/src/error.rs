//! Error types for the client crate.

use tapo_protocol::{ErrorCode, ProtocolError, TapoResponse};
use thiserror::Error;

/// Failure of a device call, a handshake or a discovery scan.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Key exchange failed, the handshake hashes did not match, or no
    /// candidate credential was accepted.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The device rejected every login variant.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The device session expired; a fresh session may succeed.
    #[error("session timeout")]
    SessionTimeout,

    /// The device is busy or rate limiting; a fresh session may succeed.
    #[error("device busy or rate limited")]
    DeviceBusy,

    /// KLAP returned 403 after a completed handshake.
    #[error("forbidden after completing handshake")]
    ForbiddenAfterHandshake,

    /// The device does not speak the secure passthrough protocol.
    #[error("transport not available")]
    TransportNotAvailable,

    /// The reply could not be decrypted, decoded or validated.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// A request or scan exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Any other non-zero device error code, or an unexpected HTTP status.
    #[error("device error {code}: {message}")]
    Device {
        /// Device error code or HTTP status.
        code: i32,
        /// Device message or code description.
        message: String,
    },

    /// Local protocol failure such as key generation.
    #[error(transparent)]
    Protocol(ProtocolError),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Whether invalidating the session and retrying may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SessionTimeout | Self::DeviceBusy)
    }

    /// Maps a non-zero device error code to its error kind.
    pub fn from_code(code: i32, msg: &str) -> Self {
        let named = ErrorCode::from_code(code);
        let message = if msg.is_empty() {
            named.description().to_string()
        } else {
            msg.to_string()
        };
        match named {
            ErrorCode::SessionTimeout => Self::SessionTimeout,
            ErrorCode::DeviceBusy => Self::DeviceBusy,
            ErrorCode::TransportNotAvailable => Self::TransportNotAvailable,
            ErrorCode::InvalidCredentials | ErrorCode::LoginFailed => {
                Self::AuthenticationFailed(format!("{} ({})", message, code))
            }
            ErrorCode::HandshakeFailed => Self::HandshakeFailed(format!("{} ({})", message, code)),
            _ => Self::Device { code, message },
        }
    }

    /// Passes a successful response through and maps failures.
    pub fn check(response: TapoResponse) -> Result<TapoResponse> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(Self::from_code(response.error_code, &response.msg))
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Deserialization(_)
            | ProtocolError::Decryption(_)
            | ProtocolError::ChecksumMismatch { .. }
            | ProtocolError::InvalidFrameMagic { .. } => Self::MalformedResponse(err.to_string()),
            other => Self::Protocol(other),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::Timeout(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
