//! Error types for duplex voice sessions

use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while running a duplex session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture device busy: {0}")]
    DeviceBusy(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Synthesis backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state transition: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an error affects the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The session is torn down.
    Fatal,
    /// Logged and reported; the session keeps running.
    Recoverable,
}

impl SessionError {
    /// Capture acquisition failures and connection loss end the session;
    /// everything else drops the offending unit of work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::DeviceNotFound(_)
                | SessionError::DeviceBusy(_)
                | SessionError::Connection(_)
                | SessionError::Config(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        if self.is_fatal() {
            ErrorSeverity::Fatal
        } else {
            ErrorSeverity::Recoverable
        }
    }

    /// Human-readable remediation for capture failures.
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            SessionError::PermissionDenied(_) => Some(
                "Grant microphone (and camera) access to this application in the OS privacy settings, then retry.",
            ),
            SessionError::DeviceNotFound(_) => {
                Some("Connect a microphone or camera and check that the OS lists it as an input device.")
            }
            SessionError::DeviceBusy(_) => {
                Some("Close other applications that are using the microphone or camera, then retry.")
            }
            SessionError::Connection(_) => {
                Some("Check network connectivity and the API key, then start a new session.")
            }
            _ => None,
        }
    }
}

impl From<cpal::DevicesError> for SessionError {
    fn from(err: cpal::DevicesError) -> Self {
        SessionError::DeviceNotFound(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for SessionError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                SessionError::DeviceNotFound(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for SessionError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                SessionError::DeviceNotFound(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for SessionError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                SessionError::DeviceNotFound(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}

impl From<native_tls::Error> for SessionError {
    fn from(err: native_tls::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::Config(format!("invalid endpoint: {}", err))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Decode(err.to_string())
    }
}

impl From<image::ImageError> for SessionError {
    fn from(err: image::ImageError) -> Self {
        SessionError::Encode(err.to_string())
    }
}

impl From<hound::Error> for SessionError {
    fn from(err: hound::Error) -> Self {
        SessionError::Recording(err.to_string())
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::BackendUnavailable(err.to_string())
    }
}

/// Backends report permission and contention problems only as text.
fn classify_backend_message(message: String) -> SessionError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        SessionError::PermissionDenied(message)
    } else if lower.contains("busy") || lower.contains("in use") || lower.contains("exclusive") {
        SessionError::DeviceBusy(message)
    } else {
        SessionError::DeviceNotFound(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_connection_errors_are_fatal() {
        assert!(SessionError::PermissionDenied("mic".into()).is_fatal());
        assert!(SessionError::DeviceBusy("mic".into()).is_fatal());
        assert!(SessionError::Connection("reset".into()).is_fatal());
        assert!(!SessionError::Decode("odd length".into()).is_fatal());
        assert!(!SessionError::BackendUnavailable("down".into()).is_fatal());
        assert_eq!(
            SessionError::Encode("zero size".into()).severity(),
            ErrorSeverity::Recoverable
        );
    }

    #[test]
    fn capture_errors_carry_remediation() {
        assert!(SessionError::PermissionDenied("x".into()).remediation_hint().is_some());
        assert!(SessionError::DeviceNotFound("x".into()).remediation_hint().is_some());
        assert!(SessionError::Playback("x".into()).remediation_hint().is_none());
    }

    #[test]
    fn backend_messages_are_classified() {
        assert!(matches!(
            classify_backend_message("Access denied by user".into()),
            SessionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_message("Device or resource busy".into()),
            SessionError::DeviceBusy(_)
        ));
        assert!(matches!(
            classify_backend_message("something else".into()),
            SessionError::DeviceNotFound(_)
        ));
    }
}
